use std::sync::Arc;

use crate::config::Config;
use crate::event::EngineHandle;
use crate::metrics::MetricsCollector;

/// Shared handle for the HTTP layer: never engine state itself, only the
/// event queue handle and read-only config/metrics (spec §9's
/// "ownership flows engine -> peers -> transports, never upward").
#[derive(Clone)]
pub struct AppState {
    pub engine_handle: EngineHandle,
    pub config: Arc<Config>,
    pub metrics: Arc<MetricsCollector>,
}
