//! Stream message queue
//!
//! Ordered FIFO of accepted messages for one stream. The ingest context pushes
//! into it; the dispatch context begins, pauses and finishes the head. A queue
//! owning its channel's preempting flag also runs the preemption machine.
//!
//! All queue state sits behind one lock. Preemption side effects (timer and
//! flag) are computed under that lock and applied after it is released, under
//! a second lock that `disable` closes for good.

use crate::context::{debug_assert_context, ExecutionContext};
use crate::metrics::{ChannelMetrics, StreamMetrics};
use crate::preemption::{
    PreemptionInputs, PreemptionMachine, PreemptionOutcome, PreemptionState, TimerCommand,
};
use crate::task::{DispatchPoster, DispatchTask, IngestPoster, IngestTask};
use crate::timer::PreemptionTimer;
use crate::transport::Transport;
use gpuchan_core::{
    Message, MessageEnvelope, OrderTracker, OrderWatcher, PreemptionConfig, StreamId,
    StreamPriority, SyncPointManager,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Collaborators shared by every queue of a channel.
#[derive(Clone)]
pub struct QueueServices {
    pub dispatch: DispatchPoster,
    pub ingest: IngestPoster,
    pub transport: Arc<dyn Transport>,
    pub sync_points: Arc<SyncPointManager>,
    pub preemption: PreemptionConfig,
    pub metrics: Arc<ChannelMetrics>,
}

impl fmt::Debug for QueueServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueServices").field("preemption", &self.preemption).finish_non_exhaustive()
    }
}

/// Preemption flags a queue participates in.
#[derive(Debug, Clone, Default)]
pub struct PreemptionFlags {
    /// Flag this queue raises while it preempts other channels
    pub preempting: Option<Arc<AtomicBool>>,
    /// Flag that, while raised, makes this queue give up dispatch turns
    pub preempted: Option<Arc<AtomicBool>>,
}

struct QueueState {
    enabled: bool,
    scheduled: bool,
    fifo: VecDeque<MessageEnvelope>,
    tracker: OrderTracker,
    preemption: Option<PreemptionMachine>,
}

impl QueueState {
    fn preemption_inputs(&self, now: Instant) -> PreemptionInputs {
        PreemptionInputs {
            now,
            head_received: self.fifo.front().map(MessageEnvelope::time_received),
            scheduled: self.scheduled,
        }
    }

    fn update_preemption(&mut self, now: Instant) -> PreemptionOutcome {
        let inputs = self.preemption_inputs(now);
        match self.preemption.as_mut() {
            Some(machine) => machine.update(inputs),
            None => PreemptionOutcome::NONE,
        }
    }
}

struct PreemptionEffects {
    timer: PreemptionTimer,
    preempting: Option<Arc<AtomicBool>>,
}

/// Thread-safe FIFO of messages for one stream.
pub struct StreamMessageQueue {
    stream_id: StreamId,
    priority: StreamPriority,
    state: Mutex<QueueState>,
    effects: Mutex<PreemptionEffects>,
    preempted: Option<Arc<AtomicBool>>,
    watcher: OrderWatcher,
    services: QueueServices,
    metrics: StreamMetrics,
    self_ref: Weak<StreamMessageQueue>,
}

impl StreamMessageQueue {
    /// Create an enabled, scheduled, empty queue.
    #[must_use]
    pub fn new(
        stream_id: StreamId,
        priority: StreamPriority,
        services: QueueServices,
        flags: PreemptionFlags,
    ) -> Arc<Self> {
        let tracker = services.sync_points.create_tracker();
        let watcher = tracker.watcher();
        let preemption = flags.preempting.as_ref().map(|_| PreemptionMachine::new(services.preemption));

        debug!(stream = %stream_id, %priority, preempting = preemption.is_some(), "Creating stream queue");

        Arc::new_cyclic(|self_ref| Self {
            stream_id,
            priority,
            state: Mutex::new(QueueState {
                enabled: true,
                scheduled: true,
                fifo: VecDeque::new(),
                tracker,
                preemption,
            }),
            effects: Mutex::new(PreemptionEffects {
                timer: PreemptionTimer::default(),
                preempting: flags.preempting,
            }),
            preempted: flags.preempted,
            watcher,
            services,
            metrics: StreamMetrics::default(),
            self_ref: self_ref.clone(),
        })
    }

    /// Accept a message from the ingest context.
    ///
    /// Returns `false` once the queue is disabled. Out-of-order kinds skip the
    /// FIFO and go straight to dispatch.
    pub fn push_back(&self, message: Message) -> bool {
        let outcome = {
            let mut state = self.state.lock();
            if !state.enabled {
                return false;
            }

            if message.kind.is_out_of_order() {
                trace!(stream = %self.stream_id, %message, "Posting out of order message");
                self.services.dispatch.post(DispatchTask::HandleOutOfOrder(message));
                return true;
            }

            let order_number = state.tracker.generate_unprocessed_order_number();
            let now = Instant::now();
            let was_empty = state.fifo.is_empty();
            trace!(stream = %self.stream_id, order_number, %message, "Enqueued message");
            state.fifo.push_back(MessageEnvelope::new(message, order_number, now));
            self.metrics.record_enqueued();

            if was_empty && state.scheduled {
                self.post_handle_message();
            }
            state.update_preemption(now)
        };

        self.apply_preemption(outcome);
        true
    }

    /// Start running the head message on the dispatch context.
    ///
    /// Returns a copy of the head, which stays queued until finished. Returns
    /// `None` for a stale wake-up (disabled, descheduled or empty) and when
    /// another channel preempts this one, in which case the turn is re-posted.
    pub fn begin_message_processing(&self) -> Option<MessageEnvelope> {
        let mut state = self.state.lock();
        if !state.enabled || !state.scheduled {
            return None;
        }
        let head = state.fifo.front()?.clone();

        if self.is_preempted() {
            trace!(stream = %self.stream_id, "Preempted, yielding dispatch turn");
            self.metrics.record_preempted_bounce();
            self.post_handle_message();
            return None;
        }

        state.tracker.begin_processing(head.order_number());
        Some(head)
    }

    /// Leave the head queued for a later turn.
    pub fn pause_message_processing(&self) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        let Some(order_number) = state.fifo.front().map(MessageEnvelope::order_number) else {
            return;
        };

        state.tracker.pause_processing(order_number);
        self.metrics.record_paused();
        if state.scheduled {
            self.post_handle_message();
        }
    }

    /// Pop the head and advance to the next message.
    pub fn finish_message_processing(&self) {
        {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            let Some(envelope) = state.fifo.pop_front() else {
                return;
            };

            state.tracker.finish_processing(envelope.order_number());
            self.metrics.record_finished();
            if !state.fifo.is_empty() && state.scheduled {
                self.post_handle_message();
            }
        }

        self.request_preemption_update();
    }

    /// Apply a schedulability change reported by a handler.
    pub fn on_rescheduled(&self, scheduled: bool) {
        {
            let mut state = self.state.lock();
            if !state.enabled || state.scheduled == scheduled {
                return;
            }
            state.scheduled = scheduled;
            debug!(stream = %self.stream_id, scheduled, "Stream rescheduled");
            if scheduled && !state.fifo.is_empty() {
                self.post_handle_message();
            }
        }

        self.request_preemption_update();
    }

    /// Permanently disable the queue.
    ///
    /// Every queued sync message gets an error reply, in order, before this
    /// returns. Panics if called twice.
    pub fn disable(&self) {
        let drained = {
            let mut state = self.state.lock();
            assert!(state.enabled, "stream {} disabled twice", self.stream_id);
            state.enabled = false;
            state.tracker.destroy();
            std::mem::take(&mut state.fifo)
        };

        {
            let mut effects = self.effects.lock();
            effects.timer.close();
            if let Some(flag) = &effects.preempting {
                flag.store(false, Ordering::Release);
            }
        }

        let drained_count = drained.len();
        for envelope in drained {
            let message = envelope.into_message();
            if message.is_sync() {
                self.services.transport.send(Message::error_reply_to(&message));
                self.services.metrics.record_error_reply();
            }
        }
        self.metrics.record_drained(drained_count as u64);

        info!(stream = %self.stream_id, drained = drained_count, "Stream disabled");
    }

    /// Re-evaluate preemption state. Runs on the ingest context.
    pub fn update_preemption_state(&self) {
        debug_assert_context(ExecutionContext::Ingest);
        let outcome = {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            state.update_preemption(Instant::now())
        };
        self.apply_preemption(outcome);
    }

    /// Handle expiry of the preemption timer armed with `generation`.
    pub(crate) fn on_preemption_timer(&self, generation: u64) {
        debug_assert_context(ExecutionContext::Ingest);
        if !self.effects.lock().timer.fire(generation) {
            trace!(stream = %self.stream_id, generation, "Ignoring stale preemption timer");
            return;
        }

        let outcome = {
            let mut state = self.state.lock();
            if !state.enabled {
                return;
            }
            let now = Instant::now();
            let inputs = state.preemption_inputs(now);
            match state.preemption.as_mut() {
                Some(machine) => {
                    machine.timer_fired();
                    machine.update(inputs)
                },
                None => return,
            }
        };
        self.apply_preemption(outcome);
    }

    fn apply_preemption(&self, outcome: PreemptionOutcome) {
        if outcome.is_none() {
            return;
        }

        let mut effects = self.effects.lock();
        if effects.timer.is_closed() {
            return;
        }

        match outcome.timer {
            TimerCommand::Keep => {},
            TimerCommand::Arm(deadline) => {
                effects.timer.arm(deadline, self.self_ref.clone(), self.services.ingest.clone());
            },
            TimerCommand::Cancel => effects.timer.cancel(),
        }

        if let (Some(value), Some(flag)) = (outcome.flag, &effects.preempting) {
            flag.store(value, Ordering::Release);
            if value {
                self.metrics.record_preemption();
                debug!(stream = %self.stream_id, "Preemption started");
            } else {
                debug!(stream = %self.stream_id, "Preemption ended");
            }
        }
    }

    fn request_preemption_update(&self) {
        if self.owns_preempting_flag() {
            self.services.ingest.post(IngestTask::UpdatePreemption(self.self_ref.clone()));
        }
    }

    /// Post a dispatch turn for this stream.
    pub fn post_handle_message(&self) {
        self.services.dispatch.post(DispatchTask::HandleMessage(self.stream_id));
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[must_use]
    pub fn priority(&self) -> StreamPriority {
        self.priority
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled
    }

    /// Number of queued messages, including a paused head.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().fifo.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().fifo.is_empty()
    }

    /// Order number of the head message.
    #[must_use]
    pub fn head_order_number(&self) -> Option<u32> {
        self.state.lock().fifo.front().map(MessageEnvelope::order_number)
    }

    /// Preemption state, `None` if this queue does not own a preempting flag.
    #[must_use]
    pub fn preemption_state(&self) -> Option<PreemptionState> {
        self.state.lock().preemption.as_ref().map(PreemptionMachine::state)
    }

    /// Deadline of the running preemption timer.
    #[must_use]
    pub fn preemption_deadline(&self) -> Option<Instant> {
        self.effects.lock().timer.deadline()
    }

    #[must_use]
    pub fn owns_preempting_flag(&self) -> bool {
        self.effects.lock().preempting.is_some()
    }

    /// Whether another channel currently preempts this queue.
    #[must_use]
    pub fn is_preempted(&self) -> bool {
        self.preempted.as_ref().is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn order_watcher(&self) -> &OrderWatcher {
        &self.watcher
    }

    #[must_use]
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }
}

impl fmt::Debug for StreamMessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessageQueue")
            .field("stream_id", &self.stream_id)
            .field("priority", &self.priority)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
