// Exit-condition classification and bounded output capture for sandbox runs

use gavel_common::types::Classification;

/// coreutils `timeout` exit status when the deadline fires.
pub const EXIT_TIMEOUT: i64 = 124;
/// 128 + SIGKILL: OOM killer, or a forced kill at the deadline.
pub const EXIT_SIGKILL: i64 = 137;
/// 128 + SIGTERM: busybox `timeout` reports the signal instead of 124.
pub const EXIT_SIGTERM: i64 = 143;

/// Slack allowed between the in-container deadline and the measured elapsed time.
const DEADLINE_TOLERANCE_MS: u64 = 50;

/// Everything observed about a finished run step.
#[derive(Debug, Clone, Default)]
pub struct RunEvidence<'a> {
    pub exit_code: Option<i64>,
    /// The outer wall-clock deadline fired and the container was killed.
    pub outer_timeout: bool,
    pub oom_killed: bool,
    pub elapsed_ms: u64,
    pub time_limit_ms: u64,
    pub stderr: &'a str,
}

/// Map a run step's exit conditions to a classification.
///
/// Timeouts are checked before anything else: a killed process may leave
/// arbitrary stderr behind.
pub fn classify_run(evidence: &RunEvidence<'_>, syntax_error_markers: &[String]) -> Classification {
    // Timeout and kill statuses only count as a timeout once the deadline passed.
    let reached_deadline =
        evidence.elapsed_ms.saturating_add(DEADLINE_TOLERANCE_MS) >= evidence.time_limit_ms;

    if evidence.outer_timeout {
        return Classification::TimeLimitExceeded;
    }
    if evidence.oom_killed {
        return Classification::MemoryLimitExceeded;
    }

    match evidence.exit_code {
        Some(0) => Classification::Success,
        Some(EXIT_TIMEOUT) | Some(EXIT_SIGTERM) | Some(EXIT_SIGKILL) if reached_deadline => {
            Classification::TimeLimitExceeded
        }
        Some(EXIT_SIGKILL) => Classification::MemoryLimitExceeded,
        Some(_) if has_marker(evidence.stderr, syntax_error_markers) => {
            Classification::CompilationError
        }
        Some(_) => Classification::RuntimeError,
        // The exec ended but Docker never reported a status.
        None => Classification::SystemError,
    }
}

fn has_marker(stderr: &str, markers: &[String]) -> bool {
    markers.iter().any(|m| stderr.contains(m.as_str()))
}

/// Stdout/stderr accumulator that stops growing at a fixed size.
///
/// The caller keeps draining the stream after the cap so the process never
/// blocks on a full pipe; excess bytes are dropped and `truncated` is set.
#[derive(Debug)]
pub struct OutputCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push_stdout(&mut self, bytes: &[u8]) {
        self.truncated |= append_bounded(&mut self.stdout, bytes, self.limit);
    }

    pub fn push_stderr(&mut self, bytes: &[u8]) {
        self.truncated |= append_bounded(&mut self.stderr, bytes, self.limit);
    }

    pub fn push_stderr_note(&mut self, note: &str) {
        self.stderr.extend_from_slice(note.as_bytes());
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Returns true if anything was dropped.
fn append_bounded(buffer: &mut Vec<u8>, bytes: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(buffer.len());
    if bytes.len() <= room {
        buffer.extend_from_slice(bytes);
        false
    } else {
        buffer.extend_from_slice(&bytes[..room]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Vec<String> {
        vec!["SyntaxError".to_string(), "IndentationError".to_string()]
    }

    fn exited(code: i64) -> RunEvidence<'static> {
        RunEvidence {
            exit_code: Some(code),
            elapsed_ms: 50,
            time_limit_ms: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_exit_is_success() {
        assert_eq!(classify_run(&exited(0), &markers()), Classification::Success);
    }

    #[test]
    fn test_outer_timeout_wins_over_everything() {
        let evidence = RunEvidence {
            outer_timeout: true,
            oom_killed: true,
            exit_code: Some(0),
            stderr: "SyntaxError",
            ..Default::default()
        };
        assert_eq!(classify_run(&evidence, &markers()), Classification::TimeLimitExceeded);
    }

    #[test]
    fn test_in_container_timeout_codes_after_deadline() {
        for code in [EXIT_TIMEOUT, EXIT_SIGTERM] {
            let late = RunEvidence {
                elapsed_ms: 1003,
                ..exited(code)
            };
            assert_eq!(classify_run(&late, &markers()), Classification::TimeLimitExceeded);
        }
    }

    #[test]
    fn test_timeout_codes_before_deadline_are_runtime_errors() {
        // A program may exit with 124 itself, or be sent SIGTERM early.
        for code in [EXIT_TIMEOUT, EXIT_SIGTERM] {
            let evidence = RunEvidence {
                exit_code: Some(code),
                elapsed_ms: 30,
                time_limit_ms: 2000,
                ..Default::default()
            };
            assert_eq!(classify_run(&evidence, &markers()), Classification::RuntimeError);
        }
    }

    #[test]
    fn test_deadline_tolerance() {
        let just_short = RunEvidence {
            elapsed_ms: 960,
            ..exited(EXIT_TIMEOUT)
        };
        assert_eq!(classify_run(&just_short, &markers()), Classification::TimeLimitExceeded);

        let well_short = RunEvidence {
            elapsed_ms: 900,
            ..exited(EXIT_TIMEOUT)
        };
        assert_eq!(classify_run(&well_short, &markers()), Classification::RuntimeError);
    }

    #[test]
    fn test_sigkill_split_by_elapsed_time() {
        let early = exited(EXIT_SIGKILL);
        assert_eq!(classify_run(&early, &markers()), Classification::MemoryLimitExceeded);

        let late = RunEvidence {
            elapsed_ms: 1000,
            ..exited(EXIT_SIGKILL)
        };
        assert_eq!(classify_run(&late, &markers()), Classification::TimeLimitExceeded);
    }

    #[test]
    fn test_oom_flag_is_memory_limit() {
        let evidence = RunEvidence {
            oom_killed: true,
            ..exited(1)
        };
        assert_eq!(classify_run(&evidence, &markers()), Classification::MemoryLimitExceeded);
    }

    #[test]
    fn test_syntax_marker_is_compilation_error() {
        let evidence = RunEvidence {
            stderr: "  File \"main.py\", line 1\n    print(\nSyntaxError: '(' was never closed",
            ..exited(1)
        };
        assert_eq!(classify_run(&evidence, &markers()), Classification::CompilationError);
    }

    #[test]
    fn test_other_nonzero_is_runtime_error() {
        let evidence = RunEvidence {
            stderr: "ZeroDivisionError: division by zero",
            ..exited(1)
        };
        assert_eq!(classify_run(&evidence, &markers()), Classification::RuntimeError);
        // Markers are per language; C++ has none.
        let cpp = RunEvidence {
            stderr: "SyntaxError",
            ..exited(1)
        };
        assert_eq!(classify_run(&cpp, &[]), Classification::RuntimeError);
    }

    #[test]
    fn test_missing_exit_code_is_system_error() {
        let evidence = RunEvidence {
            exit_code: None,
            ..Default::default()
        };
        assert_eq!(classify_run(&evidence, &markers()), Classification::SystemError);
    }

    #[test]
    fn test_capture_truncates_and_keeps_prefix() {
        let mut capture = OutputCapture::new(8);
        capture.push_stdout(b"hello");
        assert!(!capture.truncated());
        capture.push_stdout(b" world");
        capture.push_stdout(b"more");
        assert!(capture.truncated());
        assert_eq!(capture.stdout(), "hello wo");
    }

    #[test]
    fn test_capture_streams_are_independent() {
        let mut capture = OutputCapture::new(4);
        capture.push_stderr(b"err");
        capture.push_stdout(b"out");
        assert!(!capture.truncated());
        capture.push_stderr_note("\n[note]");
        assert_eq!(capture.stderr(), "err\n[note]");
        assert_eq!(capture.stdout(), "out");
    }
}
