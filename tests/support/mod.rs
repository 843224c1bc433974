#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chain_exporter_lib::health::ExportHealth;
use chain_exporter_lib::pipeline::exporter::{CheckpointStore, Exporter, LogSink};
use chain_exporter_lib::pipeline::scheduler::SchedulerConfig;
use chain_exporter_lib::pipeline::types::{BlockRange, ChannelTopics, OutputChannel, Record, WorkOutput};
use chain_exporter_lib::pipeline::{Pipeline, PipelineConfig};
use chain_exporter_lib::worker::{BlockSource, SourceKind, Worker, WorkerError};
use futures::future::BoxFuture;
use serde_json::json;

pub const PIPELINE: &str = "e2e";
pub const TOPIC_PREFIX: &str = "e2e";

/// Chain stand-in: one block record per height, a movable head and scripted range failures.
#[derive(Default)]
pub struct ScriptedChain {
    head: AtomicI64,
    failures: Mutex<HashMap<i64, String>>,
}

impl ScriptedChain {
    pub fn with_head(head: i64) -> Arc<Self> {
        let chain = Self::default();
        chain.head.store(head, Ordering::SeqCst);
        Arc::new(chain)
    }

    pub fn set_head(&self, head: i64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn fail_range_starting_at(&self, from_block: i64, message: &str) {
        self.failures
            .lock()
            .expect("failures mutex poisoned")
            .insert(from_block, message.to_string());
    }
}

impl BlockSource for ScriptedChain {
    fn kind(&self) -> SourceKind {
        SourceKind::EthBlocks
    }

    fn channels(&self) -> &'static [OutputChannel] {
        &[OutputChannel::Blocks]
    }

    fn fetch_head<'a>(&'a self) -> BoxFuture<'a, Result<i64, WorkerError>> {
        Box::pin(async move { Ok(self.head.load(Ordering::SeqCst)) })
    }

    fn fetch_range<'a>(&'a self, range: BlockRange) -> BoxFuture<'a, Result<WorkOutput, WorkerError>> {
        Box::pin(async move {
            let failure = self
                .failures
                .lock()
                .expect("failures mutex poisoned")
                .get(&range.from_block)
                .cloned();
            if let Some(message) = failure {
                return Err(WorkerError::DataIntegrity {
                    block: range.from_block,
                    message,
                });
            }

            // Later ranges finish first so release order is exercised.
            let delay = 200u64.saturating_sub(range.from_block.unsigned_abs() % 200);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            let records = range
                .blocks()
                .map(|number| Record {
                    channel: OutputChannel::Blocks,
                    block_number: number,
                    payload: json!({ "number": number, "hash": format!("0x{number:064x}") }),
                })
                .collect();
            Ok(WorkOutput::complete(range, records))
        })
    }
}

pub fn topics() -> ChannelTopics {
    ChannelTopics::with_prefix(TOPIC_PREFIX)
}

pub fn pipeline<S, C>(
    chain: Arc<ScriptedChain>,
    sink: S,
    checkpoints: C,
    block_interval: i64,
) -> Pipeline<S, C>
where
    S: LogSink,
    C: CheckpointStore,
{
    let config = PipelineConfig {
        name: PIPELINE.to_string(),
        confirmations: 2,
        block_interval,
        scheduler: SchedulerConfig {
            concurrency: 3,
            max_pending: 12,
        },
        loop_interval: Duration::from_millis(500),
        topics: topics(),
    };
    let exporter = Exporter::new(
        PIPELINE,
        sink,
        checkpoints,
        Arc::new(ExportHealth::new(Duration::from_secs(60))),
    );
    Pipeline::new(config, Worker::new(chain, 0), exporter)
}
