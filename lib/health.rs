//! Liveness of the export path: the sink answers, and something was appended recently.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::pipeline::exporter::SinkError;

/// Cheap reachability check against the sink's backing store.
pub trait SinkProbe: Send + Sync {
    fn ping<'a>(&'a self) -> BoxFuture<'a, Result<(), SinkError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug)]
struct AppendMark {
    at: Instant,
    block_number: Option<i64>,
}

/// Tracks the last successful append. Before the first append, the age counts from
/// construction so a fresh process gets one full timeout to catch up.
#[derive(Debug)]
pub struct ExportHealth {
    timeout: Duration,
    last_append: Mutex<AppendMark>,
}

impl ExportHealth {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_append: Mutex::new(AppendMark {
                at: Instant::now(),
                block_number: None,
            }),
        }
    }

    pub fn record_append(&self, block_number: i64) {
        if let Ok(mut mark) = self.last_append.lock() {
            mark.at = Instant::now();
            mark.block_number = Some(block_number);
        }
    }

    pub fn last_appended_block(&self) -> Option<i64> {
        self.last_append
            .lock()
            .ok()
            .and_then(|mark| mark.block_number)
    }

    pub fn since_last_append(&self) -> Duration {
        self.last_append
            .lock()
            .map(|mark| mark.at.elapsed())
            .unwrap_or(Duration::MAX)
    }

    /// Combines a probe result with append freshness.
    pub fn evaluate(&self, sink_reachable: Result<(), String>) -> HealthStatus {
        if let Err(reason) = sink_reachable {
            return HealthStatus::Unhealthy(format!("sink unreachable: {reason}"));
        }

        let age = self.since_last_append();
        if age >= self.timeout {
            return HealthStatus::Unhealthy(format!(
                "no successful append for {}s (limit {}s)",
                age.as_secs(),
                self.timeout.as_secs()
            ));
        }
        HealthStatus::Healthy
    }

    pub async fn check(&self, probe: &dyn SinkProbe) -> HealthStatus {
        let reachable = probe.ping().await.map_err(|err| err.to_string());
        self.evaluate(reachable)
    }
}
