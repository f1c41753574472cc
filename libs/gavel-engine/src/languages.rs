// Language profile registry: build/run recipes and resource profiles per language
use anyhow::{bail, Context, Result};
use gavel_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::policy::Rejection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub language: Language,
    pub version: String,
    pub image: String,
    /// Source file stem inside the workspace (`Main` for Java, `main` otherwise).
    pub source_name: String,
    pub file_extension: String,
    /// Shell command run before execution; `None` for interpreted languages.
    pub compile_command: Option<String>,
    pub run_command: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub tmpfs_size_mb: u32,
    /// Whether the scratch tmpfs must allow executing a compiled binary.
    #[serde(default)]
    pub scratch_exec: bool,
    pub pids_limit: i64,
    pub nofile_limit: i64,
    /// Default run-step timeout when the caller gives no time limit.
    pub wall_clock_timeout_ms: u64,
    /// Stderr fragments that mark a non-zero exit as a syntax error.
    #[serde(default)]
    pub syntax_error_markers: Vec<String>,
}

impl LanguageProfile {
    pub fn source_file(&self) -> String {
        format!("{}.{}", self.source_name, self.file_extension)
    }

    pub fn requires_compilation(&self) -> bool {
        self.compile_command.is_some()
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageProfile>,
}

/// Immutable lookup table from language to profile.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    /// The fixed table compiled into the binary.
    pub fn builtin() -> Self {
        let profiles = builtin_profiles()
            .into_iter()
            .map(|p| (p.language, p))
            .collect();
        Self { profiles }
    }

    /// Load a replacement table from a `languages.json` file.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut profiles = HashMap::new();
        for profile in languages_json.languages {
            if profile.run_command.trim().is_empty() {
                bail!("Language '{}' has an empty run command", profile.language);
            }
            if profiles.insert(profile.language, profile).is_some() {
                bail!("Duplicate language entry in languages.json");
            }
        }

        if profiles.is_empty() {
            bail!("No languages configured in languages.json");
        }

        Ok(Self { profiles })
    }

    /// Resolve a client-supplied identifier to its profile.
    pub fn resolve(&self, language_id: &str) -> Result<&LanguageProfile, Rejection> {
        language_id
            .parse::<Language>()
            .ok()
            .and_then(|language| self.profiles.get(&language))
            .ok_or_else(|| Rejection::UnsupportedLanguage(language_id.to_string()))
    }

    pub fn get(&self, language: Language) -> Option<&LanguageProfile> {
        self.profiles.get(&language)
    }

    /// Profiles sorted by language name.
    pub fn profiles(&self) -> Vec<&LanguageProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by_key(|p| p.language.as_str());
        profiles
    }

    pub fn to_json(&self) -> Result<String> {
        let json = LanguagesJson {
            languages: self.profiles().into_iter().cloned().collect(),
        };
        serde_json::to_string_pretty(&json).context("Failed to serialize languages.json")
    }
}

fn builtin_profiles() -> Vec<LanguageProfile> {
    vec![
        LanguageProfile {
            language: Language::Python,
            version: "3.11".to_string(),
            image: "python:3.11-alpine".to_string(),
            source_name: "main".to_string(),
            file_extension: "py".to_string(),
            compile_command: None,
            run_command: "python3 -u /workspace/main.py".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            tmpfs_size_mb: 50,
            scratch_exec: false,
            pids_limit: 50,
            nofile_limit: 64,
            wall_clock_timeout_ms: 15_000,
            syntax_error_markers: vec![
                "SyntaxError".to_string(),
                "IndentationError".to_string(),
                "TabError".to_string(),
            ],
        },
        LanguageProfile {
            language: Language::Javascript,
            version: "18".to_string(),
            image: "node:18-alpine".to_string(),
            source_name: "main".to_string(),
            file_extension: "js".to_string(),
            compile_command: None,
            run_command: "node /workspace/main.js".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            tmpfs_size_mb: 50,
            scratch_exec: false,
            pids_limit: 50,
            nofile_limit: 64,
            wall_clock_timeout_ms: 15_000,
            syntax_error_markers: vec!["SyntaxError".to_string()],
        },
        LanguageProfile {
            language: Language::Cpp,
            version: "13".to_string(),
            image: "gcc:13".to_string(),
            source_name: "main".to_string(),
            file_extension: "cpp".to_string(),
            compile_command: Some("g++ -O2 -std=c++17 -o /tmp/main /workspace/main.cpp".to_string()),
            run_command: "/tmp/main".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            tmpfs_size_mb: 100,
            scratch_exec: true,
            pids_limit: 50,
            nofile_limit: 64,
            wall_clock_timeout_ms: 10_000,
            syntax_error_markers: Vec::new(),
        },
        LanguageProfile {
            language: Language::C,
            version: "13".to_string(),
            image: "gcc:13".to_string(),
            source_name: "main".to_string(),
            file_extension: "c".to_string(),
            compile_command: Some("gcc -O2 -std=c11 -o /tmp/main /workspace/main.c -lm".to_string()),
            run_command: "/tmp/main".to_string(),
            memory_limit_mb: 256,
            cpu_limit: 0.5,
            tmpfs_size_mb: 100,
            scratch_exec: true,
            pids_limit: 50,
            nofile_limit: 64,
            wall_clock_timeout_ms: 10_000,
            syntax_error_markers: Vec::new(),
        },
        // The JVM needs roughly twice the default memory and more threads.
        LanguageProfile {
            language: Language::Java,
            version: "17".to_string(),
            image: "eclipse-temurin:17-jdk-alpine".to_string(),
            source_name: "Main".to_string(),
            file_extension: "java".to_string(),
            compile_command: Some("javac -d /tmp /workspace/Main.java".to_string()),
            run_command: "java -cp /tmp Main".to_string(),
            memory_limit_mb: 512,
            cpu_limit: 0.5,
            tmpfs_size_mb: 200,
            scratch_exec: false,
            pids_limit: 128,
            nofile_limit: 256,
            wall_clock_timeout_ms: 10_000,
            syntax_error_markers: Vec::new(),
        },
    ]
}
