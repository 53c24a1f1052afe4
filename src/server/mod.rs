//! Server bootstrap: wires the link, dispatcher, model provider, registry
//! and engine together, then serves the HTTP surface until shutdown.

mod router;
mod state;
mod ws;

pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatch::ActionDispatcher;
use crate::engine::ExecutionEngine;
use crate::link::ActionLink;
use crate::llm::OpenAiProvider;
use crate::planner::Planner;
use crate::registry::TaskRegistry;
use crate::verifier::Verifier;

pub async fn serve(config: Config) -> Result<()> {
    let config = Arc::new(config);

    let link = Arc::new(ActionLink::new(config.max_in_flight));
    let dispatcher = Arc::new(ActionDispatcher::new(link.clone(), &config));
    let provider = Arc::new(
        OpenAiProvider::new(config.model.clone()).context("failed to build the model client")?,
    );
    let registry = Arc::new(TaskRegistry::new());
    let engine = Arc::new(ExecutionEngine::new(
        dispatcher,
        Planner::new(provider.clone()),
        Verifier::new(provider),
        registry.clone(),
        config.clone(),
    ));

    let shutdown = CancellationToken::new();
    let state = AppState::new(
        config.clone(),
        link,
        engine,
        registry.clone(),
        shutdown.clone(),
    );
    let app = router::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(model = %config.model.model_name, "webpilot listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await
        .context("server error")?;

    // Give cancelled workers a bounded window to write their terminal state.
    shutdown.cancel();
    registry.cancel_all();
    let deadline = Instant::now() + config.action_timeout;
    while registry.active_count() > 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(100)).await;
    }
    if registry.active_count() > 0 {
        warn!(
            remaining = registry.active_count(),
            "tasks still active at shutdown deadline"
        );
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "failed to listen for ctrl-c");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("shutdown requested; cancelling active tasks");
    shutdown.cancel();
}
