// Prometheus metrics for the HTTP intake

use gavel_common::types::{Classification, ExecutionOutcome, JudgeResult, Language, Verdict};
use gavel_engine::Rejection;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gavel_executions_total",
        "Sandbox executions by language and classification",
        &["language", "classification"]
    )
    .expect("gavel_executions_total can be registered");

    pub static ref VERDICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gavel_verdicts_total",
        "Final submission verdicts by language",
        &["language", "verdict"]
    )
    .expect("gavel_verdicts_total can be registered");

    pub static ref SYSTEM_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gavel_system_errors_total",
        "Runs or submissions that ended in a judge-side failure",
        &["mode"]
    )
    .expect("gavel_system_errors_total can be registered");

    pub static ref REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gavel_rejections_total",
        "Requests rejected by the input policy",
        &["reason"]
    )
    .expect("gavel_rejections_total can be registered");

    pub static ref RUN_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "gavel_run_duration_seconds",
        "Wall-clock duration of /run and /submit handling",
        &["language", "mode"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("gavel_run_duration_seconds can be registered");
}

pub fn record_rejection(rejection: &Rejection) {
    REJECTIONS_TOTAL.with_label_values(&[rejection.reason()]).inc();
}

pub fn record_outcome(language: Language, outcome: &ExecutionOutcome) {
    EXECUTIONS_TOTAL
        .with_label_values(&[language.as_str(), outcome.classification.as_str()])
        .inc();
    if outcome.classification == Classification::SystemError {
        SYSTEM_ERRORS_TOTAL.with_label_values(&["run"]).inc();
    }
}

pub fn record_judgement(language: Language, result: &JudgeResult) {
    for case in &result.case_results {
        EXECUTIONS_TOTAL
            .with_label_values(&[language.as_str(), case.outcome.classification.as_str()])
            .inc();
    }
    let verdict = format!("{:?}", result.final_verdict);
    VERDICTS_TOTAL
        .with_label_values(&[language.as_str(), verdict.as_str()])
        .inc();
    if result.final_verdict == Verdict::SystemError {
        SYSTEM_ERRORS_TOTAL.with_label_values(&["submit"]).inc();
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
