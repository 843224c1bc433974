//! In-process sink and checkpoint store.
//!
//! Both are cheap handles over shared state, so a copy kept outside the exporter observes
//! every write and survives a simulated restart. Failures can be injected one call at a time.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;

use super::{CheckpointError, CheckpointStore, LogSink, SinkError};
use crate::health::SinkProbe;
use crate::pipeline::types::{ChannelTopics, KeyedRecord, Position};

#[derive(Debug, Default)]
struct SinkState {
    committed: BTreeMap<(String, i64), KeyedRecord>,
    staged: Option<Vec<(String, KeyedRecord)>>,
    commits: usize,
    aborts: usize,
    fail_next_append: Option<String>,
    fail_next_commit: Option<String>,
    unreachable: bool,
}

#[derive(Debug, Clone)]
pub struct MemoryLogSink {
    topics: ChannelTopics,
    state: Arc<Mutex<SinkState>>,
}

impl MemoryLogSink {
    pub fn new(topics: ChannelTopics) -> Self {
        Self {
            topics,
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        // A panicking test thread must not hide the state from the assertions that follow.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_append(&self, reason: &str) {
        self.state().fail_next_append = Some(reason.to_string());
    }

    pub fn fail_next_commit(&self, reason: &str) {
        self.state().fail_next_commit = Some(reason.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Committed records of one topic, ordered by primary key.
    pub fn committed(&self, topic: &str) -> Vec<KeyedRecord> {
        self.state()
            .committed
            .iter()
            .filter(|((record_topic, _), _)| record_topic == topic)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Every committed primary key, ascending.
    pub fn committed_keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.state().committed.keys().map(|(_, key)| *key).collect();
        keys.sort_unstable();
        keys
    }

    pub fn commits(&self) -> usize {
        self.state().commits
    }

    pub fn aborts(&self) -> usize {
        self.state().aborts
    }
}

impl LogSink for MemoryLogSink {
    fn begin<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state();
            if state.staged.is_some() {
                return Err(SinkError::TransactionState("begin while a batch is open"));
            }
            state.staged = Some(Vec::new());
            Ok(())
        })
    }

    fn append<'a>(&'a mut self, records: &'a [KeyedRecord]) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(reason) = state.fail_next_append.take() {
                return Err(SinkError::Rejected(reason));
            }
            let rows: Vec<(String, KeyedRecord)> = records
                .iter()
                .map(|keyed| (self.topics.topic(keyed.record.channel).to_string(), keyed.clone()))
                .collect();
            let staged = state
                .staged
                .as_mut()
                .ok_or(SinkError::TransactionState("append without begin"))?;
            staged.extend(rows);
            Ok(())
        })
    }

    fn commit<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(reason) = state.fail_next_commit.take() {
                return Err(SinkError::Unavailable(reason));
            }
            let staged = state
                .staged
                .take()
                .ok_or(SinkError::TransactionState("commit without begin"))?;
            for (topic, keyed) in staged {
                state.committed.insert((topic, keyed.primary_key), keyed);
            }
            state.commits += 1;
            Ok(())
        })
    }

    fn abort<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            let mut state = self.state();
            state.staged = None;
            state.aborts += 1;
            Ok(())
        })
    }
}

impl SinkProbe for MemoryLogSink {
    fn ping<'a>(&'a self) -> BoxFuture<'a, Result<(), SinkError>> {
        Box::pin(async move {
            if self.state().unreachable {
                Err(SinkError::Unavailable("memory sink marked unreachable".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

#[derive(Debug, Default)]
struct CheckpointState {
    slots: HashMap<String, Position>,
    fail_next_save: Option<String>,
    saves: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    state: Arc<Mutex<CheckpointState>>,
}

impl MemoryCheckpointStore {
    fn state(&self) -> MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed(&self, pipeline: &str, position: Position) {
        self.state().slots.insert(pipeline.to_string(), position);
    }

    pub fn position(&self, pipeline: &str) -> Option<Position> {
        self.state().slots.get(pipeline).cloned()
    }

    pub fn fail_next_save(&self, reason: &str) {
        self.state().fail_next_save = Some(reason.to_string());
    }

    pub fn saves(&self) -> usize {
        self.state().saves
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Position>, CheckpointError>> {
        Box::pin(async move { Ok(self.position(pipeline)) })
    }

    fn save<'a>(&'a self, pipeline: &'a str, position: &'a Position) -> BoxFuture<'a, Result<(), CheckpointError>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(reason) = state.fail_next_save.take() {
                return Err(CheckpointError::Unavailable(reason));
            }
            state.slots.insert(pipeline.to_string(), position.clone());
            state.saves += 1;
            Ok(())
        })
    }
}
