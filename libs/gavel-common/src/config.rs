// Runtime configuration for the judge, read once at startup from the environment

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Host directory under which per-job workspaces are staged.
    pub workspace_root: PathBuf,
    /// uid:gid the sandboxed process runs as.
    pub sandbox_user: String,
    /// Added on top of the in-container timeout to form the outer deadline.
    pub outer_timeout_slack_ms: u64,
    pub compile_timeout_ms: u64,
    /// Cap applied to each of stdout and stderr.
    pub max_output_bytes: usize,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub max_test_cases: usize,
    pub denylist_enabled: bool,
    /// 0 means no admission control.
    pub max_concurrent_runs: usize,
    pub bind_addr: String,
    pub languages_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("gavel-workspaces"),
            sandbox_user: "1001:1001".to_string(),
            outer_timeout_slack_ms: 2000,
            compile_timeout_ms: 15_000,
            max_output_bytes: 256 * 1024,
            max_code_bytes: 100_000,
            max_input_bytes: 50_000,
            max_test_cases: 200,
            denylist_enabled: true,
            max_concurrent_runs: 0,
            bind_addr: "0.0.0.0:3000".to_string(),
            languages_file: None,
        }
    }
}

impl EngineConfig {
    /// Build from `GAVEL_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            workspace_root: lookup("GAVEL_WORKSPACE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            sandbox_user: lookup("GAVEL_SANDBOX_USER").unwrap_or(defaults.sandbox_user),
            outer_timeout_slack_ms: parse_var(
                &lookup,
                "GAVEL_OUTER_TIMEOUT_SLACK_MS",
                defaults.outer_timeout_slack_ms,
            )?,
            compile_timeout_ms: parse_var(
                &lookup,
                "GAVEL_COMPILE_TIMEOUT_MS",
                defaults.compile_timeout_ms,
            )?,
            max_output_bytes: parse_var(&lookup, "GAVEL_MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            max_code_bytes: parse_var(&lookup, "GAVEL_MAX_CODE_BYTES", defaults.max_code_bytes)?,
            max_input_bytes: parse_var(&lookup, "GAVEL_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
            max_test_cases: parse_var(&lookup, "GAVEL_MAX_TEST_CASES", defaults.max_test_cases)?,
            denylist_enabled: parse_var(&lookup, "GAVEL_DENYLIST", defaults.denylist_enabled)?,
            max_concurrent_runs: parse_var(
                &lookup,
                "GAVEL_MAX_CONCURRENT_RUNS",
                defaults.max_concurrent_runs,
            )?,
            bind_addr: lookup("GAVEL_BIND_ADDR").unwrap_or(defaults.bind_addr),
            languages_file: lookup("GAVEL_LANGUAGES_FILE").map(PathBuf::from),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
