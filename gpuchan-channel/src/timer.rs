//! One-shot preemption timer backed by a tokio task.

use crate::queue::StreamMessageQueue;
use crate::task::{IngestPoster, IngestTask};
use std::sync::Weak;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Timer posting [`IngestTask::PreemptionTimer`] when it expires.
///
/// Every arm bumps the generation; an expiry whose generation is no longer
/// current was cancelled or superseded and must be ignored.
#[derive(Debug, Default)]
pub(crate) struct PreemptionTimer {
    generation: u64,
    deadline: Option<Instant>,
    handle: Option<JoinHandle<()>>,
    closed: bool,
}

impl PreemptionTimer {
    /// Start the timer, replacing any running one.
    pub(crate) fn arm(
        &mut self,
        deadline: Instant,
        queue: Weak<StreamMessageQueue>,
        ingest: IngestPoster,
    ) {
        if self.closed {
            return;
        }
        self.cancel();
        self.generation += 1;
        let generation = self.generation;

        match Handle::try_current() {
            Ok(runtime) => {
                self.handle = Some(runtime.spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    ingest.post(IngestTask::PreemptionTimer { queue, generation });
                }));
                self.deadline = Some(deadline);
                trace!(generation, "Preemption timer armed");
            },
            Err(_) => warn!("No tokio runtime available, preemption timer not started"),
        }
    }

    /// Stop the timer if it runs.
    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.deadline = None;
    }

    /// Consume an expiry. Returns `false` for stale or cancelled generations.
    pub(crate) fn fire(&mut self, generation: u64) -> bool {
        if self.closed || generation != self.generation || self.deadline.is_none() {
            return false;
        }
        self.handle = None;
        self.deadline = None;
        true
    }

    /// Cancel and refuse any further arming.
    pub(crate) fn close(&mut self) {
        self.cancel();
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}
