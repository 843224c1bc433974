use std::sync::Arc;

use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::health::{ExportHealth, SinkProbe};

pub struct AppState {
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
    pub health: Arc<ExportHealth>,
    pub sink_probe: Arc<dyn SinkProbe>,
}

impl AppState {
    pub fn new(
        shutdown_token: CancellationToken,
        health: Arc<ExportHealth>,
        sink_probe: Arc<dyn SinkProbe>,
    ) -> Self {
        Self {
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
            health,
            sink_probe,
        }
    }
}
