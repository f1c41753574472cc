/// Judge Engine - drives one submission through its test cases
///
/// **Core Responsibility:**
/// Run the cases in order through a `Sandbox`, turn each outcome into a
/// verdict, and fold them into one `JudgeResult`.
///
/// **Critical Properties:**
/// - Knows nothing about Docker; the sandbox is injected
/// - Cases run strictly sequentially, in the given order
/// - Stops at the first failing case unless `run_all` is set
/// - Never fails: a panicking sandbox call resolves to SystemError
///
/// **Per-case verdict:**
/// - Success: trimmed stdout vs trimmed expected output (Accepted / WrongAnswer)
/// - Anything else: the classification's verdict
/// - Wall time over the case limit adds TimeLimitExceeded, memory over the
///   case limit adds MemoryLimitExceeded; the highest precedence wins
///
/// **Finalization:**
/// - All passed: Accepted, score 100
/// - Otherwise: strongest failing verdict, score = floor(100 * passed / total)
/// - Wall time is summed, memory is the max across evaluated cases

use crate::sandbox::Sandbox;
use chrono::Utc;
use futures_util::FutureExt;
use gavel_common::types::{
    CaseResult, Classification, ExecutionLimits, ExecutionOutcome, ExecutionRequest, JudgeResult,
    Language, ProblemLimits, TestCase, Verdict,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JudgeOptions {
    pub limits: ProblemLimits,
    /// Keep going after a failing case (diagnostic mode).
    pub run_all: bool,
}

/// Effective limits for one case: per-case override, else problem default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaseLimits {
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
}

impl CaseLimits {
    pub fn resolve(case: &TestCase, problem: &ProblemLimits) -> Self {
        Self {
            time_limit_ms: case.time_limit_ms.unwrap_or(problem.time_limit_ms),
            memory_limit_mb: case.memory_limit_mb.unwrap_or(problem.memory_limit_mb),
        }
    }

    fn as_execution_limits(&self) -> ExecutionLimits {
        ExecutionLimits {
            time_limit_ms: Some(self.time_limit_ms),
            memory_limit_mb: Some(self.memory_limit_mb),
        }
    }
}

/// Normalize output string for comparison
///
/// Trims leading and trailing whitespace (which also absorbs `\r\n` vs `\n`
/// at the ends). Internal whitespace and case are preserved.
pub fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Verdict for one executed case.
pub fn evaluate_case(outcome: &ExecutionOutcome, case: &TestCase, limits: &CaseLimits) -> Verdict {
    let base = match outcome.classification {
        Classification::Success => {
            if normalize_output(&outcome.stdout) == normalize_output(&case.expected_output) {
                Verdict::Accepted
            } else {
                Verdict::WrongAnswer
            }
        }
        other => Verdict::from(other),
    };

    let mut verdicts = vec![base];
    if outcome.wall_time_ms > limits.time_limit_ms {
        verdicts.push(Verdict::TimeLimitExceeded);
    }
    if let Some(used_kb) = outcome.memory_used_kb {
        if used_kb > limits.memory_limit_mb.saturating_mul(1024) {
            verdicts.push(Verdict::MemoryLimitExceeded);
        }
    }

    Verdict::strongest(verdicts).unwrap_or(base)
}

/// Fold per-case results into the submission result.
///
/// `total_count` is the number of cases in the submission, which may exceed
/// the number of evaluated cases after a short-circuit.
pub fn finalize(case_results: Vec<CaseResult>, total_count: usize) -> JudgeResult {
    let passed_count = case_results
        .iter()
        .filter(|r| r.verdict == Verdict::Accepted)
        .count();
    let aggregate_wall_time_ms = case_results.iter().map(|r| r.outcome.wall_time_ms).sum();
    let max_memory_used_kb = case_results
        .iter()
        .filter_map(|r| r.outcome.memory_used_kb)
        .max()
        .unwrap_or(0);

    let (final_verdict, score) = if total_count == 0 {
        (Verdict::SystemError, 0)
    } else if passed_count == total_count {
        (Verdict::Accepted, 100)
    } else {
        let failing = case_results
            .iter()
            .map(|r| r.verdict)
            .filter(|v| *v != Verdict::Accepted);
        // Nothing evaluated and nothing failed can only mean a broken run.
        let verdict = Verdict::strongest(failing).unwrap_or(Verdict::SystemError);
        (verdict, (100 * passed_count / total_count) as u32)
    };

    JudgeResult {
        final_verdict,
        passed_count,
        total_count,
        case_results,
        aggregate_wall_time_ms,
        max_memory_used_kb,
        score,
        judged_at: Utc::now(),
    }
}

pub struct JudgeEngine {
    sandbox: Arc<dyn Sandbox>,
}

impl JudgeEngine {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox }
    }

    #[instrument(skip(self, code, language, test_cases, options), fields(language = %language, cases = test_cases.len()))]
    pub async fn judge(
        &self,
        code: &str,
        language: Language,
        test_cases: &[TestCase],
        options: &JudgeOptions,
    ) -> JudgeResult {
        if test_cases.is_empty() {
            error!("Submission has no test cases");
            return finalize(Vec::new(), 0);
        }

        info!(run_all = options.run_all, "Judging submission");

        let mut case_results = Vec::with_capacity(test_cases.len());

        for (position, case) in test_cases.iter().enumerate() {
            let index = position + 1;
            let limits = CaseLimits::resolve(case, &options.limits);
            let request = ExecutionRequest {
                code: code.to_string(),
                language,
                input: case.input.clone(),
            };

            let outcome = self.run_case(&request, &limits.as_execution_limits()).await;
            let verdict = evaluate_case(&outcome, case, &limits);

            debug!(
                case = index,
                verdict = %verdict,
                wall_time_ms = outcome.wall_time_ms,
                memory_used_kb = ?outcome.memory_used_kb,
                "Case evaluated"
            );

            case_results.push(CaseResult {
                index,
                verdict,
                outcome,
            });

            if verdict != Verdict::Accepted && !options.run_all {
                info!(case = index, verdict = %verdict, "Stopping at first failing case");
                break;
            }
        }

        let result = finalize(case_results, test_cases.len());

        if result.final_verdict == Verdict::SystemError {
            error!(passed = result.passed_count, total = result.total_count, "Submission ended in system error");
        } else {
            info!(
                verdict = %result.final_verdict,
                passed = result.passed_count,
                total = result.total_count,
                score = result.score,
                "Submission judged"
            );
        }

        result
    }

    async fn run_case(&self, request: &ExecutionRequest, limits: &ExecutionLimits) -> ExecutionOutcome {
        match AssertUnwindSafe(self.sandbox.run(request, limits))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(error = %message, "Sandbox invocation panicked");
                ExecutionOutcome::system_error(
                    Uuid::new_v4(),
                    format!("sandbox invocation panicked: {}", message),
                    0,
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Helper to create a test case
    fn make_test_case(input: &str, expected_output: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected_output.to_string(),
            time_limit_ms: None,
            memory_limit_mb: None,
        }
    }

    /// Helper to create a sandbox outcome
    fn make_outcome(classification: Classification, stdout: &str, wall_time_ms: u64) -> ExecutionOutcome {
        ExecutionOutcome {
            job_id: Uuid::new_v4(),
            success: classification == Classification::Success,
            classification,
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(if classification == Classification::Success { 0 } else { 1 }),
            wall_time_ms,
            memory_used_kb: Some(1024),
            output_truncated: false,
        }
    }

    enum Step {
        Outcome(ExecutionOutcome),
        Panic,
    }

    /// Replays a fixed script of outcomes and records what it was asked to run.
    struct ScriptedSandbox {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(String, ExecutionLimits)>>,
    }

    impl ScriptedSandbox {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, ExecutionLimits)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn run(&self, request: &ExecutionRequest, limits: &ExecutionLimits) -> ExecutionOutcome {
            self.calls
                .lock()
                .unwrap()
                .push((request.input.clone(), *limits));
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Outcome(outcome)) => outcome,
                Some(Step::Panic) => panic!("sandbox exploded"),
                None => panic!("script exhausted"),
            }
        }
    }

    /// Behaves like `print(input())`.
    struct EchoSandbox;

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn run(&self, request: &ExecutionRequest, _limits: &ExecutionLimits) -> ExecutionOutcome {
            make_outcome(Classification::Success, request.input.trim(), 20)
        }
    }

    fn engine(sandbox: Arc<dyn Sandbox>) -> JudgeEngine {
        JudgeEngine::new(sandbox)
    }

    fn limits() -> CaseLimits {
        CaseLimits {
            time_limit_ms: 1000,
            memory_limit_mb: 256,
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("  hello  "), "hello");
        assert_eq!(normalize_output("hello\r\n"), "hello");
        assert_eq!(normalize_output("\nhello world\n"), "hello world");
        assert_eq!(normalize_output("   "), "");
    }

    #[test]
    fn test_evaluate_case_compares_trimmed_output() {
        let case = make_test_case("", "  42 \n");
        let outcome = make_outcome(Classification::Success, "42", 10);
        assert_eq!(evaluate_case(&outcome, &case, &limits()), Verdict::Accepted);

        let wrong = make_outcome(Classification::Success, "43", 10);
        assert_eq!(evaluate_case(&wrong, &case, &limits()), Verdict::WrongAnswer);

        // Comparison is case sensitive.
        let case = make_test_case("", "Yes");
        let lower = make_outcome(Classification::Success, "yes", 10);
        assert_eq!(evaluate_case(&lower, &case, &limits()), Verdict::WrongAnswer);
    }

    #[test]
    fn test_evaluate_case_limit_overrides() {
        let case = make_test_case("", "ok");

        let slow = make_outcome(Classification::Success, "ok", 1001);
        assert_eq!(evaluate_case(&slow, &case, &limits()), Verdict::TimeLimitExceeded);

        let at_limit = make_outcome(Classification::Success, "ok", 1000);
        assert_eq!(evaluate_case(&at_limit, &case, &limits()), Verdict::Accepted);

        let mut heavy = make_outcome(Classification::Success, "ok", 10);
        heavy.memory_used_kb = Some(256 * 1024 + 1);
        assert_eq!(evaluate_case(&heavy, &case, &limits()), Verdict::MemoryLimitExceeded);

        // Both violated: time wins by precedence.
        heavy.wall_time_ms = 5000;
        assert_eq!(evaluate_case(&heavy, &case, &limits()), Verdict::TimeLimitExceeded);

        // Overrides never mask a stronger classification.
        let mut broken = make_outcome(Classification::CompilationError, "", 5000);
        broken.memory_used_kb = None;
        assert_eq!(evaluate_case(&broken, &case, &limits()), Verdict::CompilationError);
    }

    #[test]
    fn test_evaluate_case_with_huge_memory_limit() {
        let case = make_test_case("", "ok");
        let roomy = CaseLimits {
            time_limit_ms: 1000,
            memory_limit_mb: u64::MAX / 512,
        };
        let mut outcome = make_outcome(Classification::Success, "ok", 10);
        outcome.memory_used_kb = Some(u64::MAX);
        assert_eq!(evaluate_case(&outcome, &case, &roomy), Verdict::Accepted);
    }

    #[test]
    fn test_case_limits_fall_back_to_problem() {
        let problem = ProblemLimits {
            time_limit_ms: 3000,
            memory_limit_mb: 128,
        };
        let plain = make_test_case("", "");
        assert_eq!(
            CaseLimits::resolve(&plain, &problem),
            CaseLimits {
                time_limit_ms: 3000,
                memory_limit_mb: 128
            }
        );

        let tight = TestCase {
            time_limit_ms: Some(500),
            ..make_test_case("", "")
        };
        assert_eq!(CaseLimits::resolve(&tight, &problem).time_limit_ms, 500);
        assert_eq!(CaseLimits::resolve(&tight, &problem).memory_limit_mb, 128);
    }

    #[tokio::test]
    async fn test_python_echo_scenario_is_accepted() {
        let cases = vec![make_test_case("5\n", "5"), make_test_case("hello\n", "hello")];

        let result = engine(Arc::new(EchoSandbox))
            .judge("print(input())", Language::Python, &cases, &JudgeOptions::default())
            .await;

        assert_eq!(result.final_verdict, Verdict::Accepted);
        assert_eq!(result.passed_count, 2);
        assert_eq!(result.total_count, 2);
        assert_eq!(result.score, 100);
        assert_eq!(result.aggregate_wall_time_ms, 40);
        assert_eq!(result.max_memory_used_kb, 1024);
        assert_eq!(
            result.case_results.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_infinite_loop_is_time_limit_exceeded() {
        let sandbox = ScriptedSandbox::new(vec![Step::Outcome(make_outcome(
            Classification::TimeLimitExceeded,
            "",
            3000,
        ))]);
        let options = JudgeOptions {
            limits: ProblemLimits {
                time_limit_ms: 1000,
                memory_limit_mb: 256,
            },
            run_all: false,
        };

        let result = engine(sandbox.clone())
            .judge("while True: pass", Language::Python, &[make_test_case("", "")], &options)
            .await;

        assert_eq!(result.final_verdict, Verdict::TimeLimitExceeded);
        assert_eq!(result.passed_count, 0);
        assert_eq!(result.score, 0);
        assert_eq!(sandbox.calls()[0].1.time_limit_ms, Some(1000));
    }

    #[tokio::test]
    async fn test_short_circuit_stops_at_first_failure() {
        let sandbox = ScriptedSandbox::new(vec![
            Step::Outcome(make_outcome(Classification::Success, "1", 10)),
            Step::Outcome(make_outcome(Classification::Success, "wrong", 10)),
            Step::Outcome(make_outcome(Classification::Success, "3", 10)),
        ]);
        let cases = vec![
            make_test_case("a", "1"),
            make_test_case("b", "2"),
            make_test_case("c", "3"),
        ];

        let result = engine(sandbox.clone())
            .judge("code", Language::Cpp, &cases, &JudgeOptions::default())
            .await;

        assert_eq!(result.final_verdict, Verdict::WrongAnswer);
        assert_eq!(result.case_results.len(), 2);
        assert_eq!(result.passed_count, 1);
        assert_eq!(result.total_count, 3);
        assert_eq!(result.score, 33);
        assert_eq!(result.aggregate_wall_time_ms, 20);
        assert_eq!(
            sandbox.calls().iter().map(|(input, _)| input.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn test_runtime_error_keeps_partial_output() {
        let mut crashed = make_outcome(Classification::RuntimeError, "partial", 15);
        crashed.stderr = "Segmentation fault".to_string();
        crashed.exit_code = Some(139);
        let sandbox = ScriptedSandbox::new(vec![Step::Outcome(crashed)]);

        let result = engine(sandbox)
            .judge("code", Language::C, &[make_test_case("", "partial and more")], &JudgeOptions::default())
            .await;

        assert_eq!(result.final_verdict, Verdict::RuntimeError);
        assert_eq!(result.case_results[0].outcome.stdout, "partial");
        assert_eq!(result.case_results[0].outcome.exit_code, Some(139));
    }

    #[tokio::test]
    async fn test_run_all_reports_strongest_failure() {
        let sandbox = ScriptedSandbox::new(vec![
            Step::Outcome(make_outcome(Classification::Success, "1", 10)),
            Step::Outcome(make_outcome(Classification::RuntimeError, "", 10)),
            Step::Outcome(make_outcome(Classification::Success, "nope", 10)),
        ]);
        let cases = vec![
            make_test_case("", "1"),
            make_test_case("", "2"),
            make_test_case("", "3"),
        ];
        let options = JudgeOptions {
            run_all: true,
            ..JudgeOptions::default()
        };

        let result = engine(sandbox).judge("code", Language::Java, &cases, &options).await;

        assert_eq!(result.case_results.len(), 3);
        assert_eq!(
            result.case_results.iter().map(|r| r.verdict).collect::<Vec<_>>(),
            vec![Verdict::Accepted, Verdict::RuntimeError, Verdict::WrongAnswer]
        );
        assert_eq!(result.final_verdict, Verdict::RuntimeError);
        assert_eq!(result.score, 33);
    }

    #[tokio::test]
    async fn test_score_is_floored() {
        let sandbox = ScriptedSandbox::new(vec![
            Step::Outcome(make_outcome(Classification::Success, "1", 10)),
            Step::Outcome(make_outcome(Classification::Success, "2", 10)),
            Step::Outcome(make_outcome(Classification::Success, "x", 10)),
        ]);
        let cases = vec![
            make_test_case("", "1"),
            make_test_case("", "2"),
            make_test_case("", "3"),
        ];

        let result = engine(sandbox)
            .judge("code", Language::Javascript, &cases, &JudgeOptions::default())
            .await;

        assert_eq!(result.passed_count, 2);
        assert_eq!(result.score, 66);
    }

    #[tokio::test]
    async fn test_accepted_output_over_time_limit_is_tle() {
        let sandbox = ScriptedSandbox::new(vec![Step::Outcome(make_outcome(
            Classification::Success,
            "ok",
            750,
        ))]);
        let tight = TestCase {
            time_limit_ms: Some(500),
            ..make_test_case("", "ok")
        };

        let result = engine(sandbox.clone())
            .judge("code", Language::Python, &[tight], &JudgeOptions::default())
            .await;

        assert_eq!(result.final_verdict, Verdict::TimeLimitExceeded);
        assert_eq!(result.passed_count, 0);
        assert_eq!(sandbox.calls()[0].1.time_limit_ms, Some(500));
    }

    #[tokio::test]
    async fn test_memory_limits_reach_the_sandbox() {
        let sandbox = ScriptedSandbox::new(vec![
            Step::Outcome(make_outcome(Classification::Success, "1", 10)),
            Step::Outcome(make_outcome(Classification::MemoryLimitExceeded, "", 10)),
        ]);
        let plain = make_test_case("1\n", "1");
        let tight = TestCase {
            memory_limit_mb: Some(64),
            ..make_test_case("2\n", "2")
        };
        let options = JudgeOptions {
            limits: ProblemLimits {
                time_limit_ms: 2000,
                memory_limit_mb: 128,
            },
            run_all: false,
        };

        let result = engine(sandbox.clone())
            .judge("code", Language::Python, &[plain, tight], &options)
            .await;

        let calls = sandbox.calls();
        assert_eq!(calls[0].1.memory_limit_mb, Some(128));
        assert_eq!(calls[1].1.memory_limit_mb, Some(64));
        assert_eq!(calls[1].1.time_limit_ms, Some(2000));
        assert_eq!(result.final_verdict, Verdict::MemoryLimitExceeded);
        assert_eq!(result.passed_count, 1);
    }

    #[tokio::test]
    async fn test_panicking_sandbox_resolves_to_system_error() {
        let sandbox = ScriptedSandbox::new(vec![
            Step::Outcome(make_outcome(Classification::Success, "1", 10)),
            Step::Panic,
        ]);
        let cases = vec![make_test_case("", "1"), make_test_case("", "2")];

        let result = engine(sandbox)
            .judge("code", Language::Python, &cases, &JudgeOptions::default())
            .await;

        assert_eq!(result.final_verdict, Verdict::SystemError);
        assert_eq!(result.passed_count, 1);
        assert_eq!(result.case_results[1].verdict, Verdict::SystemError);
        assert!(result.case_results[1].outcome.stderr.contains("sandbox exploded"));
    }

    #[tokio::test]
    async fn test_empty_case_list_is_system_error() {
        let result = engine(Arc::new(EchoSandbox))
            .judge("print(1)", Language::Python, &[], &JudgeOptions::default())
            .await;

        assert_eq!(result.final_verdict, Verdict::SystemError);
        assert_eq!(result.score, 0);
        assert_eq!(result.total_count, 0);
        assert!(result.case_results.is_empty());
    }

    #[tokio::test]
    async fn test_judging_is_idempotent() {
        let judge = engine(Arc::new(EchoSandbox));
        let cases = vec![make_test_case("7\n", "7"), make_test_case("8\n", "9")];

        let first = judge
            .judge("print(input())", Language::Python, &cases, &JudgeOptions::default())
            .await;
        let second = judge
            .judge("print(input())", Language::Python, &cases, &JudgeOptions::default())
            .await;

        assert_eq!(first.final_verdict, Verdict::WrongAnswer);
        assert_eq!(first.final_verdict, second.final_verdict);
        assert_eq!(first.passed_count, second.passed_count);
    }
}
