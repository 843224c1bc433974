//! Bounded concurrent execution of range jobs with strictly ordered retrieval.
//!
//! Jobs run on a pool of at most `concurrency` tasks and may finish in any order. Their
//! outputs are parked in an index-keyed table until every lower index has been released, so
//! callers only ever observe a gap-free prefix in submission order.
//!
//! The table is owned by the driver task: completions are recorded by
//! [`TaskScheduler::collect_completions`] and released by
//! [`TaskScheduler::drain_contiguous`], both of which take `&mut self`.

use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, error, warn};

use super::types::{BlockRange, Record, WorkOutput};
use crate::worker::WorkerError;

/// Why a task did not produce usable output.
#[derive(Debug, Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task returned last_block {last_block} outside of {range}")]
    InvalidOutput { range: BlockRange, last_block: i64 },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is halted after a task failure; no new submissions are accepted")]
    Halted,
    #[error("invalid interval {range}: {message}")]
    InvalidInterval { range: BlockRange, message: String },
    #[error("interval {range} does not continue the previous interval (expected from_block {expected})")]
    NonContiguous { range: BlockRange, expected: i64 },
    #[error("task {index} over {range} failed: {failure}")]
    TaskFailed {
        index: u64,
        range: BlockRange,
        #[source]
        failure: TaskFailure,
    },
    #[error("task join error: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of jobs executing at once.
    pub concurrency: usize,
    /// Maximum number of running plus completed-but-unreleased tasks.
    pub max_pending: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_pending: 32,
        }
    }
}

enum TaskState {
    Running(AbortHandle),
    Completed(WorkOutput),
    Failed(TaskFailure),
}

struct Task {
    interval: BlockRange,
    state: TaskState,
}

/// Records released by one [`TaskScheduler::drain_contiguous`] call.
#[derive(Debug, Default)]
pub struct Drained {
    /// Highest index released so far, including earlier drains.
    pub last_index: u64,
    /// Number of tasks released by this call.
    pub released_tasks: usize,
    /// Concatenated records of the released tasks, in index order.
    pub records: Vec<Record>,
    /// Last fully processed block of the released prefix.
    pub last_block: Option<i64>,
    /// Set when a released task trimmed its tail. Every later task was discarded and the
    /// caller must re-issue ranges starting at `rewind_to + 1`.
    pub rewind_to: Option<i64>,
    /// Number of later tasks discarded because of the rewind.
    pub discarded_tasks: usize,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.released_tasks == 0
    }
}

type JobResult = (u64, Result<WorkOutput, TaskFailure>);

pub struct TaskScheduler {
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    running: JoinSet<JobResult>,
    tasks: BTreeMap<u64, Task>,
    last_submitted: u64,
    last_released: u64,
    expected_from: Option<i64>,
    halted: bool,
    /// Failure of a task dropped by a rewind, returned by the next drain.
    discarded_failure: Option<(u64, BlockRange, TaskFailure)>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            config: SchedulerConfig {
                concurrency,
                max_pending: config.max_pending.max(1),
            },
            permits: Arc::new(Semaphore::new(concurrency)),
            running: JoinSet::new(),
            tasks: BTreeMap::new(),
            last_submitted: 0,
            last_released: 0,
            expected_from: None,
            halted: false,
            discarded_failure: None,
        }
    }

    /// Backpressure gate: `false` once the task table is full or the scheduler is halted.
    pub fn admit_more(&self) -> bool {
        !self.halted && self.tasks.len() < self.config.max_pending
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Tasks whose job has not been joined yet.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Tasks held in the table (running, completed or failed, not yet released).
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn last_released_index(&self) -> u64 {
        self.last_released
    }

    /// Submits a job for `interval` and returns its index.
    ///
    /// Intervals must be non-empty and each must start right after the previous one.
    pub fn submit<F>(&mut self, interval: BlockRange, job: F) -> Result<u64, SchedulerError>
    where
        F: Future<Output = Result<WorkOutput, WorkerError>> + Send + 'static,
    {
        if self.halted {
            return Err(SchedulerError::Halted);
        }
        interval
            .validate()
            .map_err(|message| SchedulerError::InvalidInterval {
                range: interval,
                message,
            })?;
        if let Some(expected) = self.expected_from {
            if interval.from_block != expected {
                return Err(SchedulerError::NonContiguous {
                    range: interval,
                    expected,
                });
            }
        }

        let index = self.last_submitted + 1;
        let permits = Arc::clone(&self.permits);
        let handle = self.running.spawn(async move {
            // The semaphore is never closed, so acquisition only fails if that changes.
            let _permit = permits.acquire_owned().await.ok();
            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(TaskFailure::Worker(err)),
                Err(panic) => Err(TaskFailure::Panicked(panic_message(panic))),
            };
            (index, outcome)
        });

        self.tasks.insert(
            index,
            Task {
                interval,
                state: TaskState::Running(handle),
            },
        );
        self.last_submitted = index;
        self.expected_from = Some(interval.to_block + 1);

        debug!(
            event = "task_submitted",
            index,
            from_block = interval.from_block,
            to_block = interval.to_block,
            pending = self.tasks.len(),
            "submitted range task"
        );

        Ok(index)
    }

    /// Waits for at least one running job to finish and records every job that is ready.
    ///
    /// Returns the number of outcomes recorded; `0` when nothing is running.
    pub async fn collect_completions(&mut self) -> Result<usize, SchedulerError> {
        let Some(first) = self.running.join_next().await else {
            return Ok(0);
        };
        let mut recorded = self.record_joined(first)?;

        while let Some(Some(joined)) = self.running.join_next().now_or_never() {
            recorded += self.record_joined(joined)?;
        }

        Ok(recorded)
    }

    fn record_joined(
        &mut self,
        joined: Result<JobResult, JoinError>,
    ) -> Result<usize, SchedulerError> {
        match joined {
            Ok((index, outcome)) => Ok(usize::from(self.complete(index, outcome))),
            // Aborted by a rewind; the task was already removed from the table.
            Err(err) if err.is_cancelled() => Ok(0),
            Err(err) => {
                self.halted = true;
                Err(SchedulerError::Join(err))
            }
        }
    }

    /// Records the outcome of task `index`. Returns `false` if the task is unknown, which
    /// happens when it was discarded by a rewind before its result was joined.
    pub(crate) fn complete(&mut self, index: u64, outcome: Result<WorkOutput, TaskFailure>) -> bool {
        let Some(task) = self.tasks.get_mut(&index) else {
            return false;
        };

        let outcome = outcome.and_then(|output| {
            let range = task.interval;
            if output.last_block < range.from_block - 1 || output.last_block > range.to_block {
                Err(TaskFailure::InvalidOutput {
                    range,
                    last_block: output.last_block,
                })
            } else {
                Ok(output)
            }
        });

        match outcome {
            Ok(output) => {
                task.state = TaskState::Completed(output);
            }
            Err(failure) => {
                error!(
                    event = "task_failed",
                    index,
                    from_block = task.interval.from_block,
                    to_block = task.interval.to_block,
                    error = %failure,
                    "range task failed; halting new submissions"
                );
                task.state = TaskState::Failed(failure);
                self.halted = true;
            }
        }
        true
    }

    /// Releases the longest run of completed tasks directly after the last released index.
    ///
    /// Never waits and never skips a hole. If the next task failed, the error is returned
    /// once every completed task in front of it has been handed out. A failed task dropped by
    /// a rewind is reported the same way on the following call; the scheduler stays halted.
    pub fn drain_contiguous(&mut self) -> Result<Drained, SchedulerError> {
        if let Some((index, range, failure)) = self.discarded_failure.take() {
            return Err(SchedulerError::TaskFailed {
                index,
                range,
                failure,
            });
        }

        let mut drained = Drained {
            last_index: self.last_released,
            ..Drained::default()
        };

        loop {
            let next = self.last_released + 1;
            let Some(task) = self.tasks.remove(&next) else {
                break;
            };

            let output = match task.state {
                TaskState::Completed(output) => output,
                TaskState::Running(handle) => {
                    self.tasks.insert(
                        next,
                        Task {
                            interval: task.interval,
                            state: TaskState::Running(handle),
                        },
                    );
                    break;
                }
                TaskState::Failed(failure) => {
                    if drained.released_tasks > 0 {
                        self.tasks.insert(
                            next,
                            Task {
                                interval: task.interval,
                                state: TaskState::Failed(failure),
                            },
                        );
                        break;
                    }
                    return Err(SchedulerError::TaskFailed {
                        index: next,
                        range: task.interval,
                        failure,
                    });
                }
            };

            self.last_released = next;
            drained.last_index = next;
            drained.released_tasks += 1;
            drained.last_block = Some(output.last_block);
            drained.records.extend(output.records);

            if output.last_block < task.interval.to_block {
                drained.discarded_tasks = self.discard_after(next);
                drained.rewind_to = Some(output.last_block);
                self.expected_from = Some(output.last_block + 1);
                warn!(
                    event = "task_tail_trimmed",
                    index = next,
                    from_block = task.interval.from_block,
                    to_block = task.interval.to_block,
                    last_block = output.last_block,
                    discarded_tasks = drained.discarded_tasks,
                    "range task trimmed its tail; rewinding later ranges"
                );
                break;
            }
        }

        Ok(drained)
    }

    /// Drops every task after `index`, aborting the running ones and keeping the lowest
    /// failure for the next drain.
    fn discard_after(&mut self, index: u64) -> usize {
        let discarded = self.tasks.split_off(&(index + 1));
        let count = discarded.len();
        for (discarded_index, task) in discarded {
            match task.state {
                TaskState::Running(handle) => handle.abort(),
                TaskState::Failed(failure) if self.discarded_failure.is_none() => {
                    self.discarded_failure = Some((discarded_index, task.interval, failure));
                }
                TaskState::Completed(_) | TaskState::Failed(_) => {}
            }
        }
        // Indices of discarded tasks are never released; the next submission continues
        // the sequence.
        self.last_released = self.last_submitted;
        count
    }

    /// Waits for every running job and records its outcome.
    pub async fn wait_for_in_flight(&mut self) -> Result<(), SchedulerError> {
        while self.in_flight() > 0 {
            self.collect_completions().await?;
        }
        Ok(())
    }

    /// Aborts every running job and forgets all unreleased tasks.
    pub async fn abort_all(&mut self) {
        self.running.shutdown().await;
        self.tasks.clear();
        self.discarded_failure = None;
        self.halted = true;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
