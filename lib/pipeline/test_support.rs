use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::json;

use super::types::{BlockRange, OutputChannel, Record, WorkOutput};
use crate::worker::{BlockSource, SourceKind, WorkerError};

/// One `blocks` record per block, payload `{"number": n}`.
pub(crate) fn records_for(range: BlockRange) -> Vec<Record> {
    range
        .blocks()
        .map(|number| Record {
            channel: OutputChannel::Blocks,
            block_number: number,
            payload: json!({ "number": number }),
        })
        .collect()
}

/// Scripted source: a movable head, per-range failures and one-shot tail trims.
pub(crate) struct MockSource {
    head: AtomicI64,
    failures: Mutex<HashMap<i64, String>>,
    trim_once: Mutex<HashSet<i64>>,
    requested: Mutex<Vec<BlockRange>>,
}

impl MockSource {
    pub(crate) fn new(head: i64) -> Self {
        Self {
            head: AtomicI64::new(head),
            failures: Mutex::new(HashMap::new()),
            trim_once: Mutex::new(HashSet::new()),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_head(&self, head: i64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Every range starting at `from_block` fails with a data-integrity error.
    pub(crate) fn fail_range_starting_at(&self, from_block: i64, message: &str) {
        self.failures
            .lock()
            .expect("failures mutex poisoned")
            .insert(from_block, message.to_string());
    }

    /// The first range ending at `to_block` drops its last block.
    pub(crate) fn trim_tail_once(&self, to_block: i64) {
        self.trim_once
            .lock()
            .expect("trim mutex poisoned")
            .insert(to_block);
    }

    pub(crate) fn requested_ranges(&self) -> Vec<BlockRange> {
        self.requested
            .lock()
            .expect("requested mutex poisoned")
            .clone()
    }
}

impl BlockSource for MockSource {
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
            self.requested
                .lock()
                .expect("requested mutex poisoned")
                .push(range);

            if let Some(message) = self
                .failures
                .lock()
                .expect("failures mutex poisoned")
                .get(&range.from_block)
            {
                return Err(WorkerError::DataIntegrity {
                    block: range.from_block,
                    message: message.clone(),
                });
            }

            let trimmed = self
                .trim_once
                .lock()
                .expect("trim mutex poisoned")
                .remove(&range.to_block);
            if trimmed {
                let kept = BlockRange::new(range.from_block, range.to_block - 1);
                let records = if kept.is_empty() { Vec::new() } else { records_for(kept) };
                return Ok(WorkOutput {
                    records,
                    last_block: range.to_block - 1,
                });
            }

            Ok(WorkOutput::complete(range, records_for(range)))
        })
    }
}
