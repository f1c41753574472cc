use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Languages the judge knows how to build and run.
///
/// The set is closed: anything else is rejected at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Cpp,
    C,
    Java,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Python,
        Language::Javascript,
        Language::Cpp,
        Language::C,
        Language::Java,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Java => "java",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown language: {0}")]
pub struct UnknownLanguage(pub String);

/// Parses a client-supplied identifier, accepting common aliases.
impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "cpp" | "c++" | "cc" => Ok(Language::Cpp),
            "c" => Ok(Language::C),
            "java" => Ok(Language::Java),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// Verdict vocabulary exposed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Pending,
    Running,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    CompilationError,
    SystemError,
}

impl Verdict {
    /// Rank used when several verdicts apply; the higher rank wins.
    ///
    /// SystemError > CompilationError > TimeLimitExceeded > MemoryLimitExceeded
    /// > RuntimeError > WrongAnswer > Accepted. Non-terminal states rank lowest.
    pub fn precedence(&self) -> u8 {
        match self {
            Verdict::Pending | Verdict::Running => 0,
            Verdict::Accepted => 1,
            Verdict::WrongAnswer => 2,
            Verdict::RuntimeError => 3,
            Verdict::MemoryLimitExceeded => 4,
            Verdict::TimeLimitExceeded => 5,
            Verdict::CompilationError => 6,
            Verdict::SystemError => 7,
        }
    }

    /// Pick the verdict with the highest precedence.
    pub fn strongest(verdicts: impl IntoIterator<Item = Verdict>) -> Option<Verdict> {
        verdicts.into_iter().max_by_key(Verdict::precedence)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Verdict::Pending | Verdict::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pending => "Pending",
            Verdict::Running => "Running",
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "Wrong Answer",
            Verdict::TimeLimitExceeded => "Time Limit Exceeded",
            Verdict::MemoryLimitExceeded => "Memory Limit Exceeded",
            Verdict::RuntimeError => "Runtime Error",
            Verdict::CompilationError => "Compilation Error",
            Verdict::SystemError => "System Error",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a single sandbox invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Classification {
    Success,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    SystemError,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Success => "success",
            Classification::CompilationError => "compilation_error",
            Classification::RuntimeError => "runtime_error",
            Classification::TimeLimitExceeded => "time_limit_exceeded",
            Classification::MemoryLimitExceeded => "memory_limit_exceeded",
            Classification::SystemError => "system_error",
        }
    }
}

impl From<Classification> for Verdict {
    fn from(classification: Classification) -> Self {
        match classification {
            Classification::Success => Verdict::Accepted,
            Classification::CompilationError => Verdict::CompilationError,
            Classification::RuntimeError => Verdict::RuntimeError,
            Classification::TimeLimitExceeded => Verdict::TimeLimitExceeded,
            Classification::MemoryLimitExceeded => Verdict::MemoryLimitExceeded,
            Classification::SystemError => Verdict::SystemError,
        }
    }
}

/// A request that already passed the input policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub input: String,
}

/// Optional per-invocation overrides of the language profile defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub time_limit_ms: Option<u64>,
    pub memory_limit_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub job_id: Uuid,
    pub success: bool,
    pub classification: Classification,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub wall_time_ms: u64,
    pub memory_used_kb: Option<u64>,
    #[serde(default)]
    pub output_truncated: bool,
}

impl ExecutionOutcome {
    /// Outcome for a failure of the judging infrastructure itself.
    pub fn system_error(job_id: Uuid, message: impl Into<String>, wall_time_ms: u64) -> Self {
        Self {
            job_id,
            success: false,
            classification: Classification::SystemError,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            wall_time_ms,
            memory_used_kb: None,
            output_truncated: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

/// Problem-level defaults used when a test case carries no override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemLimits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}

impl Default for ProblemLimits {
    fn default() -> Self {
        Self {
            time_limit_ms: 2000,
            memory_limit_mb: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    /// 1-based position in the test-case sequence.
    pub index: usize,
    pub verdict: Verdict,
    pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResult {
    pub final_verdict: Verdict,
    pub passed_count: usize,
    pub total_count: usize,
    pub case_results: Vec<CaseResult>,
    pub aggregate_wall_time_ms: u64,
    pub max_memory_used_kb: u64,
    pub score: u32,
    pub judged_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_aliases() {
        assert_eq!("python3".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" PY ".parse::<Language>(), Ok(Language::Python));
        assert_eq!("c++".parse::<Language>(), Ok(Language::Cpp));
        assert_eq!("node".parse::<Language>(), Ok(Language::Javascript));
        assert_eq!("C".parse::<Language>(), Ok(Language::C));
        assert_eq!(
            "cobol".parse::<Language>(),
            Err(UnknownLanguage("cobol".to_string()))
        );
    }

    #[test]
    fn test_language_serde_lowercase() {
        let json = serde_json::to_string(&Language::Javascript).unwrap();
        assert_eq!(json, "\"javascript\"");
        let parsed: Language = serde_json::from_str("\"cpp\"").unwrap();
        assert_eq!(parsed, Language::Cpp);
    }

    #[test]
    fn test_verdict_precedence_order() {
        let ordered = [
            Verdict::Accepted,
            Verdict::WrongAnswer,
            Verdict::RuntimeError,
            Verdict::MemoryLimitExceeded,
            Verdict::TimeLimitExceeded,
            Verdict::CompilationError,
            Verdict::SystemError,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].precedence() < pair[1].precedence(), "{:?} vs {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_strongest_verdict() {
        let verdicts = vec![Verdict::WrongAnswer, Verdict::TimeLimitExceeded, Verdict::RuntimeError];
        assert_eq!(Verdict::strongest(verdicts), Some(Verdict::TimeLimitExceeded));
        assert_eq!(Verdict::strongest(Vec::new()), None);
    }

    #[test]
    fn test_verdict_labels_and_terminal() {
        assert_eq!(Verdict::WrongAnswer.to_string(), "Wrong Answer");
        assert_eq!(serde_json::to_string(&Verdict::WrongAnswer).unwrap(), "\"WrongAnswer\"");
        assert!(!Verdict::Pending.is_terminal());
        assert!(!Verdict::Running.is_terminal());
        assert!(Verdict::SystemError.is_terminal());
    }

    #[test]
    fn test_classification_maps_to_verdict() {
        assert_eq!(Verdict::from(Classification::Success), Verdict::Accepted);
        assert_eq!(Verdict::from(Classification::SystemError), Verdict::SystemError);
        assert_eq!(Verdict::from(Classification::TimeLimitExceeded), Verdict::TimeLimitExceeded);
    }

    #[test]
    fn test_test_case_optional_limits_default() {
        let case: TestCase =
            serde_json::from_str(r#"{"input":"1\n","expected_output":"1"}"#).unwrap();
        assert_eq!(case.time_limit_ms, None);
        assert_eq!(case.memory_limit_mb, None);
    }
}
