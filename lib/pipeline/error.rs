use thiserror::Error;

use super::exporter::ExportError;
use super::scheduler::SchedulerError;
use crate::worker::WorkerError;

/// Fatal outcome of a pipeline run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("forced stop with {in_flight} range tasks still running")]
    ForcedStop { in_flight: usize },
}
