//! Lock-free counters for channels and streams.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a channel's router and controller.
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub messages_received: AtomicU64,
    pub messages_rejected: AtomicU64,
    pub error_replies: AtomicU64,
    pub nop_replies: AtomicU64,
    pub out_of_order: AtomicU64,
    pub streams_created: AtomicU64,
    pub streams_destroyed: AtomicU64,
    pub channel_errors: AtomicU64,
    pub preempted_turns: AtomicU64,
}

impl ChannelMetrics {
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A message was refused on ingest and answered with an error if sync.
    pub fn record_rejected(&self, error_replied: bool) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        if error_replied {
            self.error_replies.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error_reply(&self) {
        self.error_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nop(&self) {
        self.nop_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_created(&self) {
        self.streams_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_destroyed(&self) {
        self.streams_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_error(&self) {
        self.channel_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatch turn was handed back because another channel preempts this one.
    pub fn record_preempted_turn(&self) {
        self.preempted_turns.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ChannelMetricsSnapshot {
        ChannelMetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            error_replies: self.error_replies.load(Ordering::Relaxed),
            nop_replies: self.nop_replies.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            streams_created: self.streams_created.load(Ordering::Relaxed),
            streams_destroyed: self.streams_destroyed.load(Ordering::Relaxed),
            channel_errors: self.channel_errors.load(Ordering::Relaxed),
            preempted_turns: self.preempted_turns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ChannelMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelMetricsSnapshot {
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub error_replies: u64,
    pub nop_replies: u64,
    pub out_of_order: u64,
    pub streams_created: u64,
    pub streams_destroyed: u64,
    pub channel_errors: u64,
    pub preempted_turns: u64,
}

/// Counters kept by one stream queue.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    pub enqueued: AtomicU64,
    pub finished: AtomicU64,
    pub paused: AtomicU64,
    pub preempted_bounces: AtomicU64,
    pub preemptions: AtomicU64,
    pub drained: AtomicU64,
}

impl StreamMetrics {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_paused(&self) {
        self.paused.fetch_add(1, Ordering::Relaxed);
    }

    /// A dispatch turn was given up because another channel preempts this one.
    pub fn record_preempted_bounce(&self) {
        self.preempted_bounces.fetch_add(1, Ordering::Relaxed);
    }

    /// This stream raised its preempting flag.
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drained(&self, count: u64) {
        self.drained.fetch_add(count, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            paused: self.paused.load(Ordering::Relaxed),
            preempted_bounces: self.preempted_bounces.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StreamMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamMetricsSnapshot {
    pub enqueued: u64,
    pub finished: u64,
    pub paused: u64,
    pub preempted_bounces: u64,
    pub preemptions: u64,
    pub drained: u64,
}
