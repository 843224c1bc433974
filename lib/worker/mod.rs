//! Source workers: the data-source side of an export pipeline.
//!
//! A [`Worker`] wraps one [`BlockSource`] with the lifecycle the driver relies on. The source
//! does the I/O; the worker enforces state transitions and tracks the last processed position.

pub mod retry;
pub mod rpc;
pub mod sources;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::{debug, info};

use crate::pipeline::context::WorkerContext;
use crate::pipeline::types::{BlockRange, OutputChannel, Position, WorkOutput};
use rpc::RpcError;
pub use sources::SourceKind;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("data integrity violation at block {block}: {message}")]
    DataIntegrity { block: i64, message: String },
    #[error("failed to decode data of block {block}: {message}")]
    Decode { block: i64, message: String },
    #[error("invalid worker transition from {from} to {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },
    #[error("worker cannot {operation} while {state}")]
    NotReady {
        operation: &'static str,
        state: WorkerState,
    },
}

/// Fetches and decodes chain data for one source.
///
/// `fetch_range` must be safe to call again for the same range after a failure, and its
/// records must be ordered by block within the range.
pub trait BlockSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Channels this source writes to.
    fn channels(&self) -> &'static [OutputChannel];

    fn fetch_head<'a>(&'a self) -> BoxFuture<'a, Result<i64, WorkerError>>;

    fn fetch_range<'a>(&'a self, range: BlockRange) -> BoxFuture<'a, Result<WorkOutput, WorkerError>>;
}

impl<T> BlockSource for Arc<T>
where
    T: BlockSource + ?Sized,
{
    fn kind(&self) -> SourceKind {
        (**self).kind()
    }

    fn channels(&self) -> &'static [OutputChannel] {
        (**self).channels()
    }

    fn fetch_head<'a>(&'a self) -> BoxFuture<'a, Result<i64, WorkerError>> {
        (**self).fetch_head()
    }

    fn fetch_range<'a>(&'a self, range: BlockRange) -> BoxFuture<'a, Result<WorkOutput, WorkerError>> {
        (**self).fetch_range(range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Uninitialized,
    Initialized,
    CatchingUp,
    Live,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Uninitialized => "uninitialized",
            WorkerState::Initialized => "initialized",
            WorkerState::CatchingUp => "catching_up",
            WorkerState::Live => "live",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }

    fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Uninitialized, Initialized)
                | (Initialized, CatchingUp)
                | (Initialized, Live)
                | (CatchingUp, CatchingUp)
                | (CatchingUp, Live)
                | (Live, Live)
                | (Live, CatchingUp)
                | (Initialized | CatchingUp | Live, Stopping)
                | (Stopping, Stopped)
        )
    }

    fn accepts_work(self) -> bool {
        matches!(
            self,
            WorkerState::Initialized | WorkerState::CatchingUp | WorkerState::Live
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Worker {
    source: Arc<dyn BlockSource>,
    start_block: i64,
    state: WorkerState,
    last_processed: Option<Position>,
}

impl Worker {
    pub fn new(source: Arc<dyn BlockSource>, start_block: i64) -> Self {
        Self {
            source,
            start_block,
            state: WorkerState::Uninitialized,
            last_processed: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    pub fn channels(&self) -> &'static [OutputChannel] {
        self.source.channels()
    }

    /// Resolves where a run starts: the recovered checkpoint, or the position just before
    /// `start_block` with no keys assigned yet.
    pub fn init_position(&self, last_recovered: Option<Position>) -> Position {
        last_recovered.unwrap_or_else(|| Position::genesis(self.start_block))
    }

    /// Moves the worker to `Initialized` at the resolved starting position.
    pub fn init(&mut self, checkpoint: Option<Position>) -> Result<Position, WorkerError> {
        self.transition(WorkerState::Initialized)?;
        let position = self.init_position(checkpoint);
        info!(
            event = "worker_initialized",
            source = self.kind().as_str(),
            block_number = position.block_number,
            primary_key = position.primary_key,
            "worker initialized"
        );
        self.last_processed = Some(position.clone());
        Ok(position)
    }

    /// Switches between catch-up and live operation to follow the analyzer's decision.
    pub fn enter_mode(&mut self, mode: WorkerContext) -> Result<(), WorkerError> {
        let next = match mode {
            WorkerContext::HistoricCatchUp => WorkerState::CatchingUp,
            WorkerContext::LiveCurrent | WorkerContext::NoWorkSleep => WorkerState::Live,
        };
        if next != self.state {
            debug!(
                event = "worker_mode_changed",
                from = self.state.as_str(),
                to = next.as_str(),
                "worker mode changed"
            );
        }
        self.transition(next)
    }

    /// Probes the chain head through the source.
    pub fn fetch_head(&self) -> BoxFuture<'_, Result<i64, WorkerError>> {
        self.source.fetch_head()
    }

    /// Builds the job for `range`. The returned future owns everything it needs so the
    /// scheduler can run it on its pool.
    pub fn work(
        &self,
        range: BlockRange,
    ) -> Result<BoxFuture<'static, Result<WorkOutput, WorkerError>>, WorkerError> {
        if !self.state.accepts_work() {
            return Err(WorkerError::NotReady {
                operation: "work",
                state: self.state,
            });
        }
        let source = Arc::clone(&self.source);
        Ok(Box::pin(async move { source.fetch_range(range).await }))
    }

    pub fn last_processed_position(&self) -> Option<&Position> {
        self.last_processed.as_ref()
    }

    /// Records the position the exporter just persisted.
    pub fn record_processed(&mut self, position: Position) {
        self.last_processed = Some(position);
    }

    pub fn begin_stop(&mut self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Stopping)
    }

    pub fn finish_stop(&mut self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Stopped)
    }

    fn transition(&mut self, next: WorkerState) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}
