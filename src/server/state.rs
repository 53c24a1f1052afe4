use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::ExecutionEngine;
use crate::link::ActionLink;
use crate::registry::TaskRegistry;

/// Shared state handed to every handler. Everything is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub link: Arc<ActionLink>,
    pub engine: Arc<ExecutionEngine>,
    pub registry: Arc<TaskRegistry>,
    /// Root token; every task worker runs on a child of it.
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        link: Arc<ActionLink>,
        engine: Arc<ExecutionEngine>,
        registry: Arc<TaskRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            link,
            engine,
            registry,
            shutdown,
            started_at: Utc::now(),
        }
    }
}
