use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;
use tokio::sync::OnceCell;

use crate::build_info;

/// Registers build identity as a gauge fixed at `1` carrying version and commit labels.
pub fn register_build_info_metric(registry: &mut Registry, prefix: &str) {
    let build_info_metric = Family::<BuildInfoLabels, Gauge>::default();
    build_info_metric
        .get_or_create(&BuildInfoLabels {
            service: env!("CARGO_PKG_NAME"),
            version: build_info::VERSION,
            commit: build_info::short_commit_hash(),
        })
        .set(1);
    registry.sub_registry_with_prefix(prefix).register(
        "build_info",
        "Build identity labels for this process",
        build_info_metric,
    );
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct BuildInfoLabels {
    service: &'static str,
    version: &'static str,
    commit: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TopicLabels {
    pub topic: String,
}

#[derive(Clone, Debug, Default)]
pub struct ExportMetrics {
    /// Records committed to the sink, per topic.
    pub records_exported_total: Family<TopicLabels, Counter>,
    /// Batches whose checkpoint was persisted.
    pub batches_exported_total: Counter,
    /// Range tasks submitted to the scheduler.
    pub tasks_submitted_total: Counter,
    /// Times a trimmed range forced later ranges to be re-issued.
    pub rewinds_total: Counter,
    /// Block number of the last persisted checkpoint.
    pub last_exported_block: Gauge,
    /// Confirmed head the driver is working towards.
    pub confirmed_head: Gauge,
    pub tasks_in_flight: Gauge,
    /// Running plus completed-but-unreleased tasks.
    pub tasks_pending: Gauge,
    /// 0 = historic catch-up, 1 = live, 2 = idle.
    pub worker_mode: Gauge,
}

impl ExportMetrics {
    pub fn register(registry: &mut Registry, prefix: &str) -> Self {
        let metrics = Self::default();
        metrics.register_into(registry, prefix);
        metrics
    }

    /// Registers handles to these metrics; clones share their values.
    pub fn register_into(&self, registry: &mut Registry, prefix: &str) {
        let metrics = self;
        let sub_registry = registry.sub_registry_with_prefix(prefix);
        sub_registry.register(
            "records_exported",
            "Total number of records committed to the sink",
            metrics.records_exported_total.clone(),
        );
        sub_registry.register(
            "batches_exported",
            "Total number of batches exported with a persisted checkpoint",
            metrics.batches_exported_total.clone(),
        );
        sub_registry.register(
            "tasks_submitted",
            "Total number of range tasks submitted",
            metrics.tasks_submitted_total.clone(),
        );
        sub_registry.register(
            "rewinds",
            "Total number of range rewinds caused by trimmed tails",
            metrics.rewinds_total.clone(),
        );
        sub_registry.register(
            "last_exported_block",
            "Block number of the last persisted checkpoint",
            metrics.last_exported_block.clone(),
        );
        sub_registry.register(
            "confirmed_head",
            "Confirmed chain head the exporter is working towards",
            metrics.confirmed_head.clone(),
        );
        sub_registry.register(
            "tasks_in_flight",
            "Range tasks currently running",
            metrics.tasks_in_flight.clone(),
        );
        sub_registry.register(
            "tasks_pending",
            "Range tasks running or waiting for release",
            metrics.tasks_pending.clone(),
        );
        sub_registry.register(
            "worker_mode",
            "Current mode: 0 historic catch-up, 1 live, 2 idle",
            metrics.worker_mode.clone(),
        );
    }
}

pub static EXPORT_METRICS: OnceCell<ExportMetrics> = OnceCell::const_new();

#[cfg(test)]
mod tests {
    use prometheus_client::encoding::text::encode;
    use prometheus_client::registry::Registry;

    use super::{register_build_info_metric, ExportMetrics, TopicLabels};

    #[test]
    fn metrics_are_exposed_with_prefix() {
        let mut registry = Registry::default();
        let metrics = ExportMetrics::register(&mut registry, "exporter");
        register_build_info_metric(&mut registry, "worker");

        metrics
            .records_exported_total
            .get_or_create(&TopicLabels {
                topic: "eth-blocks".to_string(),
            })
            .inc_by(3);
        metrics.last_exported_block.set(1_040);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).expect("encode");

        assert!(buffer.contains("exporter_records_exported_total{topic=\"eth-blocks\"} 3"));
        assert!(buffer.contains("exporter_last_exported_block 1040"));
        assert!(buffer.contains("worker_build_info{"));
    }
}
