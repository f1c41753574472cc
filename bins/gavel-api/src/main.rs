mod handlers;
mod metrics;
mod routes;

use anyhow::{Context, Result};
use gavel_common::config::EngineConfig;
use gavel_engine::{DockerSandbox, InputPolicy, JudgeEngine, LanguageRegistry, Sandbox};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{info, warn};

pub struct AppState {
    pub sandbox: Arc<dyn Sandbox>,
    pub judge: JudgeEngine,
    pub policy: InputPolicy,
    pub registry: Arc<LanguageRegistry>,
    /// Bounds concurrent sandbox work; `None` means unbounded.
    pub admission: Option<Arc<Semaphore>>,
}

impl AppState {
    pub fn new(sandbox: Arc<dyn Sandbox>, registry: Arc<LanguageRegistry>, config: &EngineConfig) -> Self {
        let admission = match config.max_concurrent_runs {
            0 => None,
            permits => Some(Arc::new(Semaphore::new(permits))),
        };

        Self {
            judge: JudgeEngine::new(sandbox.clone()),
            sandbox,
            policy: InputPolicy::from_config(config),
            registry,
            admission,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Gavel API booting...");

    let config = EngineConfig::from_env().context("Invalid configuration")?;

    let registry = Arc::new(match &config.languages_file {
        Some(path) => {
            info!(path = %path.display(), "Loading language table");
            LanguageRegistry::load(path)?
        }
        None => LanguageRegistry::builtin(),
    });
    info!(languages = registry.profiles().len(), "Language registry ready");

    let sandbox = Arc::new(DockerSandbox::connect(&config, registry.clone())?);
    match sandbox.ping().await {
        Ok(()) => info!("Connected to Docker"),
        Err(e) => warn!(error = %e, "Docker not reachable yet, runs will fail with SystemError"),
    }

    let state = Arc::new(AppState::new(sandbox, registry, &config));
    match &state.admission {
        Some(_) => info!(max_concurrent_runs = config.max_concurrent_runs, "Admission control enabled"),
        None => info!("Admission control disabled"),
    }

    let app = routes::routes().with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("HTTP server listening on {}", config.bind_addr);
    info!("Ready to judge");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Gavel API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining in-flight requests");
}
