//! Sync point manager
//!
//! Shares one order number generator between every stream of every channel
//! in the process and keeps a registry of live order trackers so that other
//! subsystems can wait for a stream to reach a given order number.

use crate::error::OrderError;
use crate::order::{OrderNumberGenerator, OrderTracker, OrderWatcher};
use crate::types::SequenceId;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Registry of order trackers sharing one number generator.
#[derive(Debug, Default)]
pub struct SyncPointManager {
    generator: Arc<OrderNumberGenerator>,
    watchers: Arc<DashMap<SequenceId, OrderWatcher>>,
}

impl SyncPointManager {
    /// Create an independent manager with its own generator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide manager used by channels that are not given one.
    #[must_use]
    pub fn global() -> Arc<SyncPointManager> {
        static GLOBAL: OnceLock<Arc<SyncPointManager>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(SyncPointManager::new())))
    }

    /// Create a tracker registered with this manager until destroyed.
    #[must_use]
    pub fn create_tracker(&self) -> OrderTracker {
        let tracker =
            OrderTracker::registered(Arc::clone(&self.generator), Arc::clone(&self.watchers));
        debug!(sequence = %tracker.sequence_id(), "Registered order tracker");
        tracker
    }

    /// Watcher of a live tracker.
    #[must_use]
    pub fn order_watcher(&self, sequence_id: SequenceId) -> Option<OrderWatcher> {
        self.watchers.get(&sequence_id).map(|entry| entry.value().clone())
    }

    /// Wait until the tracker `sequence_id` has processed `order_number`.
    ///
    /// # Errors
    /// [`OrderError::UnknownSequence`] if no such tracker is live, otherwise
    /// whatever [`OrderWatcher::wait_for_processed`] reports.
    pub async fn wait_for_order(
        &self,
        sequence_id: SequenceId,
        order_number: u32,
    ) -> Result<(), OrderError> {
        let watcher =
            self.order_watcher(sequence_id).ok_or(OrderError::UnknownSequence { sequence_id })?;
        watcher.wait_for_processed(order_number).await
    }

    /// Number of live trackers.
    #[must_use]
    pub fn tracker_count(&self) -> usize {
        self.watchers.len()
    }

    /// Shared generator, exposed for diagnostics.
    #[must_use]
    pub fn generator(&self) -> &Arc<OrderNumberGenerator> {
        &self.generator
    }
}
