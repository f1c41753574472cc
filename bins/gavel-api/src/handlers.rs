// HTTP route handlers for the Gavel API

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use gavel_common::types::{ExecutionLimits, Language, ProblemLimits, TestCase};
use gavel_engine::{JudgeOptions, Rejection, Sandbox};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub code: String,
    pub language: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub time_limit_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub run_all: bool,
}

#[derive(Debug, Serialize)]
pub struct LanguageSummary {
    pub language: Language,
    pub version: String,
    pub image: String,
    pub compiled: bool,
    pub memory_limit_mb: u32,
    pub default_timeout_ms: u64,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

fn reject(rejection: Rejection) -> Response {
    warn!(reason = rejection.reason(), error = %rejection, "Request rejected");
    metrics::record_rejection(&rejection);
    error_response(StatusCode::BAD_REQUEST, rejection.to_string())
}

impl AppState {
    /// Wait for an admission permit when concurrency is bounded.
    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, Response> {
        let Some(semaphore) = &self.admission else {
            return Ok(None);
        };

        semaphore
            .clone()
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| error_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down"))
    }
}

/// POST /run - Execute code once against a single input
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunRequest>,
) -> Response {
    let limits = ExecutionLimits {
        time_limit_ms: payload.time_limit_ms,
        memory_limit_mb: None,
    };

    let request = match state.policy.validate(
        &state.registry,
        &payload.code,
        &payload.language,
        &payload.input,
        &limits,
    ) {
        Ok(request) => request,
        Err(rejection) => return reject(rejection),
    };

    let _permit = match state.admit().await {
        Ok(permit) => permit,
        Err(response) => return response,
    };

    let timer = metrics::RUN_DURATION_SECONDS
        .with_label_values(&[request.language.as_str(), "run"])
        .start_timer();
    let outcome = state.sandbox.run(&request, &limits).await;
    timer.observe_duration();

    metrics::record_outcome(request.language, &outcome);
    info!(
        job_id = %outcome.job_id,
        language = %request.language,
        classification = outcome.classification.as_str(),
        "Run completed"
    );

    (StatusCode::OK, Json(outcome)).into_response()
}

/// POST /submit - Judge code against a sequence of test cases
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<SubmitRequest>,
) -> Response {
    let defaults = ProblemLimits::default();
    let options = JudgeOptions {
        limits: ProblemLimits {
            time_limit_ms: payload.time_limit_ms.unwrap_or(defaults.time_limit_ms),
            memory_limit_mb: payload.memory_limit_mb.unwrap_or(defaults.memory_limit_mb),
        },
        run_all: payload.run_all,
    };

    let request = match state.policy.validate_submission(
        &state.registry,
        &payload.code,
        &payload.language,
        &payload.test_cases,
        &options.limits,
    ) {
        Ok(request) => request,
        Err(rejection) => return reject(rejection),
    };

    let _permit = match state.admit().await {
        Ok(permit) => permit,
        Err(response) => return response,
    };

    let timer = metrics::RUN_DURATION_SECONDS
        .with_label_values(&[request.language.as_str(), "submit"])
        .start_timer();
    let result = state
        .judge
        .judge(&request.code, request.language, &payload.test_cases, &options)
        .await;
    timer.observe_duration();

    metrics::record_judgement(request.language, &result);
    info!(
        language = %request.language,
        verdict = %result.final_verdict,
        passed = result.passed_count,
        total = result.total_count,
        "Submission completed"
    );

    (StatusCode::OK, Json(result)).into_response()
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /languages - Supported languages and their resource profiles
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let languages: Vec<LanguageSummary> = state
        .registry
        .profiles()
        .into_iter()
        .map(|profile| LanguageSummary {
            language: profile.language,
            version: profile.version.clone(),
            image: profile.image.clone(),
            compiled: profile.requires_compilation(),
            memory_limit_mb: profile.memory_limit_mb,
            default_timeout_ms: profile.wall_clock_timeout_ms,
        })
        .collect();

    Json(languages)
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics() -> Response {
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
        }
    }
}
