use std::fmt;
use std::future::Future;

use tracing::{debug, warn};

/// Operating mode of one driver iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerContext {
    /// Issued ranges lag behind the confirmed head; keep draining without sleeping.
    HistoricCatchUp,
    /// The confirmed head just advanced; issue the new blocks, then sleep.
    LiveCurrent,
    /// The chain has not advanced enough since the last probe; sleep and only probe again.
    NoWorkSleep,
}

impl WorkerContext {
    /// Whether the driver should sleep once this cycle's work is done.
    pub fn sleeps_after_cycle(self) -> bool {
        !matches!(self, WorkerContext::HistoricCatchUp)
    }

    /// Whether this cycle may issue data fetches.
    pub fn fetches_data(self) -> bool {
        !matches!(self, WorkerContext::NoWorkSleep)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerContext::HistoricCatchUp => "historic_catch_up",
            WorkerContext::LiveCurrent => "live_current",
            WorkerContext::NoWorkSleep => "no_work_sleep",
        }
    }

    /// Numeric encoding exported on the mode gauge.
    pub fn as_gauge_value(self) -> i64 {
        match self {
            WorkerContext::HistoricCatchUp => 0,
            WorkerContext::LiveCurrent => 1,
            WorkerContext::NoWorkSleep => 2,
        }
    }
}

impl fmt::Display for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode decision plus the (possibly refreshed) confirmed head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Analysis {
    pub mode: WorkerContext,
    pub confirmed_head: i64,
}

/// Decides between catch-up, live and idle operation.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContextAnalyzer {
    confirmations: i64,
}

impl WorkerContextAnalyzer {
    pub fn new(confirmations: i64) -> Self {
        Self {
            confirmations: confirmations.max(0),
        }
    }

    /// Picks the mode for the next cycle.
    ///
    /// `fetch_head` is only awaited when everything up to `last_confirmed` has already been
    /// issued, so a pipeline working through a backlog never pays for head probes.
    pub async fn analyze<F, Fut, E>(
        &self,
        last_issued: i64,
        last_confirmed: i64,
        fetch_head: F,
    ) -> Result<Analysis, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<i64, E>>,
    {
        if last_issued < last_confirmed {
            return Ok(Analysis {
                mode: WorkerContext::HistoricCatchUp,
                confirmed_head: last_confirmed,
            });
        }

        let head = fetch_head().await?;
        Ok(self.classify_probe(head, last_confirmed))
    }

    /// Classifies one head probe against the previously confirmed head.
    pub fn classify_probe(&self, probed_head: i64, last_confirmed: i64) -> Analysis {
        let candidate = probed_head.saturating_sub(self.confirmations);

        if candidate == last_confirmed {
            debug!(
                event = "head_unchanged",
                probed_head,
                confirmed_head = last_confirmed,
                "confirmed head has not advanced"
            );
            return Analysis {
                mode: WorkerContext::NoWorkSleep,
                confirmed_head: last_confirmed,
            };
        }

        if candidate < last_confirmed {
            warn!(
                event = "head_behind_confirmed",
                probed_head,
                candidate_head = candidate,
                confirmed_head = last_confirmed,
                "remote head is behind the previously confirmed head; keeping the old head"
            );
            return Analysis {
                mode: WorkerContext::NoWorkSleep,
                confirmed_head: last_confirmed,
            };
        }

        Analysis {
            mode: WorkerContext::LiveCurrent,
            confirmed_head: candidate,
        }
    }
}
