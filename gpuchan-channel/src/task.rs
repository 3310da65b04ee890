//! Work items posted between the ingest and dispatch contexts.

use crate::error::ChannelError;
use crate::queue::StreamMessageQueue;
use gpuchan_core::{Message, StreamId};
use std::sync::Weak;
use tokio::sync::mpsc;
use tracing::trace;

/// Work executed on the dispatch context.
#[derive(Debug)]
pub enum DispatchTask {
    /// Run the head message of a stream
    HandleMessage(StreamId),
    /// Run a message that bypassed its stream's FIFO
    HandleOutOfOrder(Message),
    /// A handler's schedulability changed
    StreamRescheduled { stream_id: StreamId, scheduled: bool },
    /// Tear the channel down
    ChannelError(ChannelError),
}

/// Work executed on the ingest context.
#[derive(Debug)]
pub enum IngestTask {
    /// A preemption timer expired
    PreemptionTimer { queue: Weak<StreamMessageQueue>, generation: u64 },
    /// Re-evaluate a queue's preemption state
    UpdatePreemption(Weak<StreamMessageQueue>),
}

impl IngestTask {
    /// Execute the task. Tasks for queues that are gone are dropped.
    pub fn run(self) {
        match self {
            Self::PreemptionTimer { queue, generation } => match queue.upgrade() {
                Some(queue) => queue.on_preemption_timer(generation),
                None => trace!(generation, "Preemption timer fired for a dropped queue"),
            },
            Self::UpdatePreemption(queue) => {
                if let Some(queue) = queue.upgrade() {
                    queue.update_preemption_state();
                }
            },
        }
    }
}

/// Cloneable handle posting [`DispatchTask`]s.
#[derive(Debug, Clone)]
pub struct DispatchPoster {
    sender: mpsc::UnboundedSender<DispatchTask>,
}

impl DispatchPoster {
    /// Post a task; returns `false` once the dispatch loop is gone.
    pub fn post(&self, task: DispatchTask) -> bool {
        self.sender.send(task).is_ok()
    }
}

/// Cloneable handle posting [`IngestTask`]s.
#[derive(Debug, Clone)]
pub struct IngestPoster {
    sender: mpsc::UnboundedSender<IngestTask>,
}

impl IngestPoster {
    /// Post a task; returns `false` once the ingest loop is gone.
    pub fn post(&self, task: IngestTask) -> bool {
        self.sender.send(task).is_ok()
    }
}

/// Create the dispatch task channel.
#[must_use]
pub fn dispatch_channel() -> (DispatchPoster, mpsc::UnboundedReceiver<DispatchTask>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (DispatchPoster { sender }, receiver)
}

/// Create the ingest task channel.
#[must_use]
pub fn ingest_channel() -> (IngestPoster, mpsc::UnboundedReceiver<IngestTask>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (IngestPoster { sender }, receiver)
}
