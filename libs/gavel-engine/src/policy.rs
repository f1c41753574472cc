//! Input policy guard.
//!
//! Runs before any workspace or container exists, so a rejected request costs
//! nothing. Checks, in order: language support, code size, input size,
//! requested limits against the language profile, and a textual denylist.
//!
//! The denylist is a speed bump, not a security boundary. It is trivially
//! bypassed (aliasing, string building, reflection); the container isolation in
//! [`crate::sandbox`] is what actually contains hostile code.

use gavel_common::config::EngineConfig;
use gavel_common::types::{ExecutionLimits, ExecutionRequest, ProblemLimits, TestCase};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::languages::{LanguageProfile, LanguageRegistry};

/// Client errors. Never retried, never reach the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("code must not be empty")]
    EmptyCode,

    #[error("code is {size} bytes, limit is {limit}")]
    CodeTooLarge { size: usize, limit: usize },

    #[error("input is {size} bytes, limit is {limit}")]
    InputTooLarge { size: usize, limit: usize },

    #[error("code contains a disallowed operation: {0}")]
    DangerousPattern(String),

    #[error("at least one test case is required")]
    NoTestCases,

    #[error("{count} test cases submitted, limit is {limit}")]
    TooManyTestCases { count: usize, limit: usize },

    #[error("time limit of {requested} ms exceeds the maximum of {limit} ms")]
    TimeLimitTooLarge { requested: u64, limit: u64 },

    #[error("memory limit of {requested} MB exceeds the maximum of {limit} MB")]
    MemoryLimitTooLarge { requested: u64, limit: u64 },
}

impl Rejection {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::UnsupportedLanguage(_) => "unsupported_language",
            Rejection::EmptyCode => "empty_code",
            Rejection::CodeTooLarge { .. } => "code_too_large",
            Rejection::InputTooLarge { .. } => "input_too_large",
            Rejection::DangerousPattern(_) => "dangerous_pattern",
            Rejection::NoTestCases => "no_test_cases",
            Rejection::TooManyTestCases { .. } => "too_many_test_cases",
            Rejection::TimeLimitTooLarge { .. } => "time_limit_too_large",
            Rejection::MemoryLimitTooLarge { .. } => "memory_limit_too_large",
        }
    }
}

lazy_static! {
    static ref DENYLIST: Vec<(&'static str, Regex)> = [
        ("system()", r"\bsystem\s*\("),
        // Not a method call, so `/re/.exec(s)` in JavaScript passes.
        ("exec()", r"(?:^|[^.\w])exec[lv]?p?e?\s*\("),
        ("eval()", r"\beval\s*\("),
        ("fork()", r"\bfork\s*\("),
        ("popen()", r"\bpopen\s*\("),
        ("import os", r"\bimport\s+os\b"),
        ("import subprocess", r"\bimport\s+subprocess\b"),
        ("from os import", r"\bfrom\s+os\s+import\b"),
        ("__import__", r"__import__"),
        ("Runtime.getRuntime", r"Runtime\s*\.\s*getRuntime"),
        ("ProcessBuilder", r"\bProcessBuilder\b"),
        ("child_process", r"child_process"),
        ("rm -rf", r"rm\s+-rf"),
    ]
    .into_iter()
    .map(|(label, pattern)| {
        (label, Regex::new(pattern).expect("denylist pattern must compile"))
    })
    .collect();
}

#[derive(Debug, Clone)]
pub struct InputPolicy {
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub max_test_cases: usize,
    pub denylist_enabled: bool,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl InputPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_code_bytes: config.max_code_bytes,
            max_input_bytes: config.max_input_bytes,
            max_test_cases: config.max_test_cases,
            denylist_enabled: config.denylist_enabled,
        }
    }

    /// Validate an ad-hoc run request and turn it into an accepted request.
    pub fn validate(
        &self,
        registry: &LanguageRegistry,
        code: &str,
        language: &str,
        input: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionRequest, Rejection> {
        let profile = registry.resolve(language)?;
        self.check_code(code)?;
        self.check_input(input)?;
        check_limits(profile, limits)?;
        self.check_denylist(code)?;

        Ok(ExecutionRequest {
            code: code.to_string(),
            language: profile.language,
            input: input.to_string(),
        })
    }

    /// Validate a submission; each test-case input is held to the input ceiling,
    /// and the problem limits and every per-case override to the profile's.
    ///
    /// The returned request carries an empty input; the judge fills it per case.
    pub fn validate_submission(
        &self,
        registry: &LanguageRegistry,
        code: &str,
        language: &str,
        test_cases: &[TestCase],
        problem_limits: &ProblemLimits,
    ) -> Result<ExecutionRequest, Rejection> {
        let profile = registry.resolve(language)?;
        self.check_code(code)?;

        if test_cases.is_empty() {
            return Err(Rejection::NoTestCases);
        }
        if test_cases.len() > self.max_test_cases {
            return Err(Rejection::TooManyTestCases {
                count: test_cases.len(),
                limit: self.max_test_cases,
            });
        }
        for case in test_cases {
            self.check_input(&case.input)?;
        }

        check_limits(
            profile,
            &ExecutionLimits {
                time_limit_ms: Some(problem_limits.time_limit_ms),
                memory_limit_mb: Some(problem_limits.memory_limit_mb),
            },
        )?;
        for case in test_cases {
            check_limits(
                profile,
                &ExecutionLimits {
                    time_limit_ms: case.time_limit_ms,
                    memory_limit_mb: case.memory_limit_mb,
                },
            )?;
        }
        self.check_denylist(code)?;

        Ok(ExecutionRequest {
            code: code.to_string(),
            language: profile.language,
            input: String::new(),
        })
    }

    fn check_code(&self, code: &str) -> Result<(), Rejection> {
        if code.trim().is_empty() {
            return Err(Rejection::EmptyCode);
        }
        if code.len() > self.max_code_bytes {
            return Err(Rejection::CodeTooLarge {
                size: code.len(),
                limit: self.max_code_bytes,
            });
        }
        Ok(())
    }

    fn check_input(&self, input: &str) -> Result<(), Rejection> {
        if input.len() > self.max_input_bytes {
            return Err(Rejection::InputTooLarge {
                size: input.len(),
                limit: self.max_input_bytes,
            });
        }
        Ok(())
    }

    fn check_denylist(&self, code: &str) -> Result<(), Rejection> {
        if !self.denylist_enabled {
            return Ok(());
        }
        match DENYLIST.iter().find(|(_, pattern)| pattern.is_match(code)) {
            Some((label, _)) => Err(Rejection::DangerousPattern(label.to_string())),
            None => Ok(()),
        }
    }
}

/// Requested limits may tighten the profile's ceilings, never raise them.
fn check_limits(profile: &LanguageProfile, limits: &ExecutionLimits) -> Result<(), Rejection> {
    if let Some(requested) = limits.time_limit_ms {
        if requested > profile.wall_clock_timeout_ms {
            return Err(Rejection::TimeLimitTooLarge {
                requested,
                limit: profile.wall_clock_timeout_ms,
            });
        }
    }
    if let Some(requested) = limits.memory_limit_mb {
        let limit = u64::from(profile.memory_limit_mb);
        if requested > limit {
            return Err(Rejection::MemoryLimitTooLarge { requested, limit });
        }
    }
    Ok(())
}
