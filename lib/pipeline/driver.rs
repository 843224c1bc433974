//! The driver loop tying the analyzer, scheduler, worker and exporter together.
//!
//! One driver task owns every piece of mutable pipeline state. Each cycle it picks a mode,
//! submits ranges while the scheduler admits them, waits for at least one completion,
//! exports the ordered prefix and sleeps when the mode asks for it.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::context::{Analysis, WorkerContextAnalyzer};
use super::error::Error;
use super::exporter::{CheckpointStore, Exporter, LogSink};
use super::interval::next_interval;
use super::scheduler::{SchedulerConfig, SchedulerError, TaskScheduler};
use super::types::{ChannelTopics, OutputChannel, Position};
use crate::server::monitoring::{ExportMetrics, TopicLabels};
use crate::worker::Worker;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Checkpoint slot name.
    pub name: String,
    pub confirmations: i64,
    /// Blocks per range task.
    pub block_interval: i64,
    pub scheduler: SchedulerConfig,
    /// Idle sleep between cycles once caught up.
    pub loop_interval: Duration,
    pub topics: ChannelTopics,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub start_position: Position,
    pub last_position: Position,
    pub exported_records: u64,
    pub exported_batches: u64,
}

/// Mutable progress of one run.
#[derive(Debug)]
struct Cursor {
    last_issued: i64,
    confirmed_head: i64,
    position: Position,
    exported_records: u64,
    exported_batches: u64,
    /// A trimmed tail was just rewound; wait one loop interval before fetching it again.
    rewound: bool,
}

pub struct Pipeline<S, C> {
    config: PipelineConfig,
    worker: Worker,
    exporter: Exporter<S, C>,
    scheduler: TaskScheduler,
    analyzer: WorkerContextAnalyzer,
    metrics: Option<ExportMetrics>,
}

impl<S, C> Pipeline<S, C>
where
    S: LogSink,
    C: CheckpointStore,
{
    pub fn new(config: PipelineConfig, worker: Worker, exporter: Exporter<S, C>) -> Self {
        Self {
            scheduler: TaskScheduler::new(config.scheduler),
            analyzer: WorkerContextAnalyzer::new(config.confirmations),
            config,
            worker,
            exporter,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ExportMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs until `shutdown` fires or a fatal error occurs.
    ///
    /// Both paths wait for running tasks and export whatever drains in order before
    /// returning. `force` aborts running tasks immediately instead.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        force: CancellationToken,
    ) -> Result<RunSummary, Error> {
        let recovered = self.exporter.get_last_position().await?;
        let start = self.worker.init(recovered)?;
        let start_position = start.clone();

        info!(
            event = "pipeline_started",
            pipeline = %self.config.name,
            source = self.worker.kind().as_str(),
            start_block = start.block_number + 1,
            primary_key = start.primary_key,
            confirmations = self.config.confirmations,
            block_interval = self.config.block_interval,
            concurrency = self.config.scheduler.concurrency,
            max_pending = self.config.scheduler.max_pending,
            "starting export pipeline"
        );
        if let Some(metrics) = &self.metrics {
            metrics.last_exported_block.set(start.block_number);
        }

        let mut cursor = Cursor {
            last_issued: start.block_number,
            confirmed_head: start.block_number,
            position: start,
            exported_records: 0,
            exported_batches: 0,
            rewound: false,
        };

        let outcome = tokio::select! {
            biased;
            _ = force.cancelled() => Err(Error::ForcedStop { in_flight: 0 }),
            result = self.drive(&mut cursor, &shutdown) => result,
        };

        let outcome = match outcome {
            Err(Error::ForcedStop { .. }) => Err(self.abort().await),
            Err(err @ Error::Export(_)) => {
                // The sink or checkpoint store is broken; nothing more can be exported.
                self.scheduler.abort_all().await;
                Err(err)
            }
            Ok(()) => {
                info!(
                    event = "pipeline_stopping",
                    pipeline = %self.config.name,
                    in_flight = self.scheduler.in_flight(),
                    "shutdown requested; finishing in-flight ranges"
                );
                tokio::select! {
                    biased;
                    _ = force.cancelled() => Err(self.abort().await),
                    result = self.wind_down(&mut cursor) => result,
                }
            }
            Err(err) => {
                error!(
                    event = "pipeline_failed",
                    pipeline = %self.config.name,
                    error = %err,
                    "fatal pipeline error; exporting completed ranges before exit"
                );
                let wound_down = tokio::select! {
                    biased;
                    _ = force.cancelled() => Err(self.abort().await),
                    result = self.wind_down(&mut cursor) => result,
                };
                if let Err(secondary) = wound_down {
                    warn!(
                        event = "pipeline_wind_down_failed",
                        pipeline = %self.config.name,
                        error = %secondary,
                        "failed to export completed ranges after a fatal error"
                    );
                }
                Err(err)
            }
        };

        outcome?;

        let last_position = self
            .worker
            .last_processed_position()
            .cloned()
            .unwrap_or(cursor.position);
        info!(
            event = "pipeline_stopped",
            pipeline = %self.config.name,
            block_number = last_position.block_number,
            primary_key = last_position.primary_key,
            exported_records = cursor.exported_records,
            exported_batches = cursor.exported_batches,
            "export pipeline stopped"
        );

        Ok(RunSummary {
            start_position,
            last_position,
            exported_records: cursor.exported_records,
            exported_batches: cursor.exported_batches,
        })
    }

    async fn drive(&mut self, cursor: &mut Cursor, shutdown: &CancellationToken) -> Result<(), Error> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let worker = &self.worker;
            let analysis = self
                .analyzer
                .analyze(cursor.last_issued, cursor.confirmed_head, || worker.fetch_head())
                .await?;
            self.apply_analysis(cursor, analysis)?;

            if analysis.mode.fetches_data() && !cursor.rewound {
                self.submit_ready(cursor)?;
            }

            if self.scheduler.in_flight() > 0 {
                tokio::select! {
                    collected = self.scheduler.collect_completions() => {
                        collected?;
                    }
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }

            let exported = self.export_drained(cursor).await?;
            self.update_task_gauges();

            // A halted scheduler with nothing left to join or drain can make no progress.
            if !exported
                && self.scheduler.is_halted()
                && self.scheduler.in_flight() == 0
                && self.scheduler.pending() == 0
            {
                return Err(SchedulerError::Halted.into());
            }

            let idle = self.scheduler.in_flight() == 0;
            if idle && (analysis.mode.sleeps_after_cycle() || cursor.rewound) {
                cursor.rewound = false;
                tokio::select! {
                    _ = tokio::time::sleep(self.config.loop_interval) => {}
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
        }
    }

    fn apply_analysis(&mut self, cursor: &mut Cursor, analysis: Analysis) -> Result<(), Error> {
        if analysis.confirmed_head != cursor.confirmed_head {
            info!(
                event = "confirmed_head_advanced",
                pipeline = %self.config.name,
                mode = analysis.mode.as_str(),
                from = cursor.confirmed_head,
                to = analysis.confirmed_head,
                "confirmed head advanced"
            );
        }
        cursor.confirmed_head = analysis.confirmed_head;
        self.worker.enter_mode(analysis.mode)?;

        if let Some(metrics) = &self.metrics {
            metrics.confirmed_head.set(analysis.confirmed_head);
            metrics.worker_mode.set(analysis.mode.as_gauge_value());
        }
        Ok(())
    }

    fn submit_ready(&mut self, cursor: &mut Cursor) -> Result<(), Error> {
        while self.scheduler.admit_more() {
            let Some(range) =
                next_interval(cursor.last_issued, self.config.block_interval, cursor.confirmed_head)
            else {
                break;
            };

            let job = self.worker.work(range)?;
            self.scheduler.submit(range, job)?;
            cursor.last_issued = range.to_block;

            if let Some(metrics) = &self.metrics {
                metrics.tasks_submitted_total.inc();
            }
        }
        Ok(())
    }

    /// Exports the ordered prefix the scheduler can release. Returns whether anything was
    /// released.
    async fn export_drained(&mut self, cursor: &mut Cursor) -> Result<bool, Error> {
        let drained = self.scheduler.drain_contiguous()?;
        let Some(last_block) = drained.last_block else {
            return Ok(false);
        };

        if let Some(rewind_to) = drained.rewind_to {
            cursor.last_issued = rewind_to;
            cursor.rewound = true;
            if let Some(metrics) = &self.metrics {
                metrics.rewinds_total.inc();
            }
        }

        let mut per_channel: HashMap<OutputChannel, u64> = HashMap::new();
        for record in &drained.records {
            *per_channel.entry(record.channel).or_default() += 1;
        }
        let record_count = drained.records.len() as u64;

        let proposed = cursor.position.advanced_to(last_block);
        let persisted = self
            .exporter
            .append_and_checkpoint(drained.records, proposed)
            .await?;

        info!(
            event = "range_exported",
            pipeline = %self.config.name,
            tasks = drained.released_tasks,
            last_index = drained.last_index,
            records = record_count,
            block_number = persisted.block_number,
            primary_key = persisted.primary_key,
            "exported ordered ranges"
        );

        if let Some(metrics) = &self.metrics {
            for (channel, count) in per_channel {
                metrics
                    .records_exported_total
                    .get_or_create(&TopicLabels {
                        topic: self.config.topics.topic(channel).to_string(),
                    })
                    .inc_by(count);
            }
            metrics.batches_exported_total.inc();
            metrics.last_exported_block.set(persisted.block_number);
        }

        self.worker.record_processed(persisted.clone());
        cursor.position = persisted;
        cursor.exported_records += record_count;
        cursor.exported_batches += 1;
        Ok(true)
    }

    /// Waits for running tasks and exports every range that drains in order.
    async fn wind_down(&mut self, cursor: &mut Cursor) -> Result<(), Error> {
        self.worker.begin_stop()?;
        self.scheduler.wait_for_in_flight().await?;
        while self.export_drained(cursor).await? {}
        self.update_task_gauges();
        self.worker.finish_stop()?;
        Ok(())
    }

    async fn abort(&mut self) -> Error {
        let in_flight = self.scheduler.in_flight();
        warn!(
            event = "pipeline_forced_stop",
            pipeline = %self.config.name,
            in_flight,
            "forced stop; aborting running ranges"
        );
        self.scheduler.abort_all().await;
        Error::ForcedStop { in_flight }
    }

    fn update_task_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.tasks_in_flight.set(self.scheduler.in_flight() as i64);
            metrics.tasks_pending.set(self.scheduler.pending() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{Pipeline, PipelineConfig, RunSummary};
    use crate::health::ExportHealth;
    use crate::pipeline::error::Error;
    use crate::pipeline::exporter::memory::{MemoryCheckpointStore, MemoryLogSink};
    use crate::pipeline::exporter::Exporter;
    use crate::pipeline::scheduler::{SchedulerConfig, SchedulerError};
    use crate::pipeline::test_support::MockSource;
    use crate::pipeline::types::{ChannelTopics, Position};
    use crate::server::monitoring::ExportMetrics;
    use crate::worker::Worker;

    struct Harness {
        source: Arc<MockSource>,
        sink: MemoryLogSink,
        store: MemoryCheckpointStore,
        metrics: ExportMetrics,
        shutdown: CancellationToken,
        force: CancellationToken,
    }

    impl Harness {
        fn new(head: i64) -> Self {
            Self {
                source: Arc::new(MockSource::new(head)),
                sink: MemoryLogSink::new(ChannelTopics::with_prefix("test")),
                store: MemoryCheckpointStore::default(),
                metrics: ExportMetrics::default(),
                shutdown: CancellationToken::new(),
                force: CancellationToken::new(),
            }
        }

        fn spawn(
            &self,
            confirmations: i64,
            block_interval: i64,
            concurrency: usize,
        ) -> tokio::task::JoinHandle<Result<RunSummary, Error>> {
            let config = PipelineConfig {
                name: "test".to_string(),
                confirmations,
                block_interval,
                scheduler: SchedulerConfig {
                    concurrency,
                    max_pending: concurrency * 4,
                },
                loop_interval: Duration::from_millis(500),
                topics: ChannelTopics::with_prefix("test"),
            };
            let exporter = Exporter::new(
                "test",
                self.sink.clone(),
                self.store.clone(),
                Arc::new(ExportHealth::new(Duration::from_secs(60))),
            );
            let worker = Worker::new(self.source.clone(), 0);
            let pipeline = Pipeline::new(config, worker, exporter).with_metrics(self.metrics.clone());
            tokio::spawn(pipeline.run(self.shutdown.clone(), self.force.clone()))
        }

        async fn wait_for_block(&self, block: i64) {
            while self
                .store
                .position("test")
                .map_or(true, |position| position.block_number < block)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }

        fn exported_blocks(&self) -> Vec<i64> {
            self.sink
                .committed("test-blocks")
                .iter()
                .map(|keyed| keyed.record.block_number)
                .collect()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn catches_up_then_follows_the_head() {
        let harness = Harness::new(22);
        let handle = harness.spawn(2, 5, 3);

        harness.wait_for_block(20).await;
        assert_eq!(harness.exported_blocks(), (0..=20).collect::<Vec<_>>());
        assert_eq!(harness.metrics.confirmed_head.get(), 20);

        harness.source.set_head(30);
        harness.wait_for_block(28).await;

        harness.shutdown.cancel();
        let summary = handle.await.expect("join").expect("run");

        assert_eq!(summary.start_position, Position::new(-1, 0));
        assert_eq!(summary.last_position, Position::new(28, 29));
        assert_eq!(harness.store.position("test"), Some(summary.last_position.clone()));
        assert_eq!(harness.exported_blocks(), (0..=28).collect::<Vec<_>>());
        assert_eq!(harness.sink.committed_keys(), (1..=29).collect::<Vec<_>>());
        assert_eq!(harness.metrics.last_exported_block.get(), 28);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_pipeline_only_probes_the_head() {
        let harness = Harness::new(10);
        let handle = harness.spawn(0, 100, 2);

        harness.wait_for_block(10).await;
        let requested = harness.source.requested_ranges().len();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(harness.source.requested_ranges().len(), requested);

        harness.shutdown.cancel();
        handle.await.expect("join").expect("run");
    }

    #[tokio::test(start_paused = true)]
    async fn trimmed_tail_is_fetched_again_without_gaps() {
        let harness = Harness::new(20);
        harness.source.trim_tail_once(9);
        let handle = harness.spawn(0, 5, 4);

        harness.wait_for_block(20).await;
        harness.shutdown.cancel();
        handle.await.expect("join").expect("run");

        assert_eq!(harness.exported_blocks(), (0..=20).collect::<Vec<_>>());
        assert_eq!(harness.sink.committed_keys(), (1..=21).collect::<Vec<_>>());
        assert!(harness.metrics.rewinds_total.get() >= 1);
        assert!(harness
            .source
            .requested_ranges()
            .iter()
            .any(|range| range.from_block == 9));
    }

    #[tokio::test(start_paused = true)]
    async fn task_failure_exports_ordered_prefix_then_fails() {
        let harness = Harness::new(100);
        harness.source.fail_range_starting_at(10, "receipts missing");
        let handle = harness.spawn(0, 5, 4);

        let err = handle.await.expect("join").expect_err("fatal");
        match err {
            Error::Scheduler(SchedulerError::TaskFailed { range, .. }) => {
                assert_eq!(range.from_block, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(harness.exported_blocks(), (0..=9).collect::<Vec<_>>());
        assert_eq!(harness.store.position("test"), Some(Position::new(9, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_a_trimmed_range_is_reported() {
        let harness = Harness::new(20);
        harness.source.trim_tail_once(4);
        harness.source.fail_range_starting_at(5, "receipts missing");
        let handle = harness.spawn(0, 5, 4);

        let err = tokio::time::timeout(Duration::from_secs(60), handle)
            .await
            .expect("pipeline stops")
            .expect("join")
            .expect_err("fatal");
        match err {
            Error::Scheduler(SchedulerError::TaskFailed { range, .. }) => {
                assert_eq!(range.from_block, 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(harness.exported_blocks(), (0..=3).collect::<Vec<_>>());
        assert_eq!(harness.store.position("test"), Some(Position::new(3, 4)));
        assert_eq!(harness.metrics.rewinds_total.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_from_persisted_checkpoint() {
        let harness = Harness::new(30);
        harness.store.seed("test", Position::new(19, 20));
        let handle = harness.spawn(0, 4, 2);

        harness.wait_for_block(30).await;
        harness.shutdown.cancel();
        let summary = handle.await.expect("join").expect("run");

        assert_eq!(summary.start_position, Position::new(19, 20));
        assert_eq!(summary.last_position, Position::new(30, 31));
        assert_eq!(harness.store.position("test"), Some(summary.last_position.clone()));
        assert_eq!(harness.source.requested_ranges()[0].from_block, 20);
        assert_eq!(harness.exported_blocks(), (20..=30).collect::<Vec<_>>());
        assert_eq!(harness.sink.committed_keys(), (21..=31).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_stops_without_advancing_checkpoint() {
        let harness = Harness::new(9);
        harness.sink.fail_next_commit("broker down");
        let handle = harness.spawn(0, 10, 1);

        let err = handle.await.expect("join").expect_err("export fails");
        assert!(matches!(err, Error::Export(_)));
        assert_eq!(harness.store.position("test"), None);
        assert!(harness.sink.committed_keys().is_empty());
    }
}
