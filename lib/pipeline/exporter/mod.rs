//! The only component that performs durable, externally visible writes.
//!
//! A batch goes `begin` → `append` → `commit` on the [`LogSink`]; the position is persisted
//! through the [`CheckpointStore`] only after the commit succeeded. A crash between the two
//! re-emits the batch on restart under the same primary keys.

pub mod memory;
pub mod pg;

use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, error, info};

use super::types::{KeyedRecord, Position, Record};
use crate::health::ExportHealth;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink rejected the batch: {0}")]
    Rejected(String),
    #[error("invalid sink transaction state: {0}")]
    TransactionState(&'static str),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    #[error("stored checkpoint for {pipeline} is unreadable: {message}")]
    Corrupt { pipeline: String, message: String },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("position {proposed} would move the checkpoint back from {current}")]
    NonMonotonic { current: i64, proposed: i64 },
}

/// Append-only destination with explicit transaction boundaries.
///
/// Readers that only see committed data never observe part of a batch.
pub trait LogSink: Send {
    fn begin<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>>;

    fn append<'a>(&'a mut self, records: &'a [KeyedRecord]) -> BoxFuture<'a, Result<(), SinkError>>;

    fn commit<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>>;

    fn abort<'a>(&'a mut self) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// One durable slot per pipeline name.
pub trait CheckpointStore: Send + Sync {
    fn load<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Position>, CheckpointError>>;

    fn save<'a>(&'a self, pipeline: &'a str, position: &'a Position) -> BoxFuture<'a, Result<(), CheckpointError>>;
}

impl<T> CheckpointStore for Arc<T>
where
    T: CheckpointStore + ?Sized,
{
    fn load<'a>(&'a self, pipeline: &'a str) -> BoxFuture<'a, Result<Option<Position>, CheckpointError>> {
        (**self).load(pipeline)
    }

    fn save<'a>(&'a self, pipeline: &'a str, position: &'a Position) -> BoxFuture<'a, Result<(), CheckpointError>> {
        (**self).save(pipeline, position)
    }
}

pub struct Exporter<S, C> {
    pipeline: String,
    sink: S,
    checkpoints: C,
    health: Arc<ExportHealth>,
    last_position: Option<Position>,
}

impl<S, C> Exporter<S, C>
where
    S: LogSink,
    C: CheckpointStore,
{
    pub fn new(pipeline: impl Into<String>, sink: S, checkpoints: C, health: Arc<ExportHealth>) -> Self {
        Self {
            pipeline: pipeline.into(),
            sink,
            checkpoints,
            health,
            last_position: None,
        }
    }

    /// Reads the persisted position. Called once at startup.
    pub async fn get_last_position(&mut self) -> Result<Option<Position>, ExportError> {
        let position = self.checkpoints.load(&self.pipeline).await?;
        match &position {
            Some(position) => info!(
                event = "checkpoint_loaded",
                pipeline = %self.pipeline,
                block_number = position.block_number,
                primary_key = position.primary_key,
                "resuming from persisted checkpoint"
            ),
            None => info!(
                event = "checkpoint_missing",
                pipeline = %self.pipeline,
                "no persisted checkpoint"
            ),
        }
        self.last_position = position.clone();
        Ok(position)
    }

    /// Last position this exporter persisted or loaded.
    pub fn last_position(&self) -> Option<&Position> {
        self.last_position.as_ref()
    }

    /// Writes `records` as one transaction, then persists `position` with its primary key
    /// set to the last key assigned. Keys continue from the previously persisted key, or from
    /// `position.primary_key` when nothing was persisted yet.
    ///
    /// An empty batch only advances the checkpoint.
    pub async fn append_and_checkpoint(
        &mut self,
        records: Vec<Record>,
        position: Position,
    ) -> Result<Position, ExportError> {
        let base_key = match &self.last_position {
            Some(current) => {
                if position.block_number < current.block_number {
                    return Err(ExportError::NonMonotonic {
                        current: current.block_number,
                        proposed: position.block_number,
                    });
                }
                current.primary_key
            }
            None => position.primary_key,
        };

        let keyed = assign_keys(base_key, records);
        let last_key = keyed.last().map_or(base_key, |record| record.primary_key);

        if !keyed.is_empty() {
            self.write_batch(&keyed).await?;
        }

        let persisted = Position {
            primary_key: last_key,
            ..position
        };
        if let Err(err) = self.checkpoints.save(&self.pipeline, &persisted).await {
            error!(
                event = "checkpoint_persist_failed",
                pipeline = %self.pipeline,
                block_number = persisted.block_number,
                primary_key = persisted.primary_key,
                error = %err,
                "batch committed but checkpoint was not persisted; it will be re-emitted on restart"
            );
            return Err(err.into());
        }

        debug!(
            event = "batch_exported",
            pipeline = %self.pipeline,
            records = keyed.len(),
            block_number = persisted.block_number,
            primary_key = persisted.primary_key,
            "exported batch"
        );

        self.health.record_append(persisted.block_number);
        self.last_position = Some(persisted.clone());
        Ok(persisted)
    }

    async fn write_batch(&mut self, keyed: &[KeyedRecord]) -> Result<(), SinkError> {
        self.sink.begin().await?;

        let written = match self.sink.append(keyed).await {
            Ok(()) => self.sink.commit().await,
            Err(err) => Err(err),
        };

        if let Err(err) = written {
            if let Err(abort_err) = self.sink.abort().await {
                error!(
                    event = "sink_abort_failed",
                    pipeline = %self.pipeline,
                    error = %abort_err,
                    "failed to abort sink transaction"
                );
            }
            return Err(err);
        }
        Ok(())
    }
}

fn assign_keys(base_key: i64, records: Vec<Record>) -> Vec<KeyedRecord> {
    records
        .into_iter()
        .zip(1..)
        .map(|(record, offset)| KeyedRecord {
            primary_key: base_key + offset,
            record,
        })
        .collect()
}
