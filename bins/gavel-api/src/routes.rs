// Route table for the Gavel API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/run", post(handlers::run_code))
        .route("/submit", post(handlers::submit))
        .route("/health", get(handlers::health_check))
        .route("/languages", get(handlers::list_languages))
        .route("/metrics", get(handlers::export_metrics))
}
