//! Order number tracking
//!
//! Every message accepted for a stream gets an order number from a shared
//! [`OrderNumberGenerator`]. The stream's [`OrderTracker`] records which
//! numbers were handed out and how far dispatch has progressed; any number
//! of [`OrderWatcher`]s observe that progress and can wait on it.

use crate::error::OrderError;
use crate::types::SequenceId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Source of globally increasing order numbers.
#[derive(Debug)]
pub struct OrderNumberGenerator {
    next: AtomicU32,
}

impl OrderNumberGenerator {
    /// Create a generator whose first number is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { next: AtomicU32::new(1) }
    }

    /// Hand out the next order number.
    ///
    /// Numbers never wrap: the generator panics once `u32::MAX` is reached.
    pub fn generate(&self) -> u32 {
        match self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| next.checked_add(1)) {
            Ok(order_number) => order_number,
            Err(_) => panic!("order numbers exhausted"),
        }
    }

    /// The number the next call to [`generate`](Self::generate) returns.
    #[must_use]
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for OrderNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    processed: u32,
    destroyed: bool,
}

#[derive(Debug)]
struct Shared {
    sequence_id: SequenceId,
    unprocessed: AtomicU32,
    progress: watch::Sender<Progress>,
}

/// Per-stream order number bookkeeping, owned by the stream's queue.
///
/// Mutating calls check their preconditions and panic on violation; they are
/// serialized by the owning queue's lock.
#[derive(Debug)]
pub struct OrderTracker {
    shared: Arc<Shared>,
    generator: Arc<OrderNumberGenerator>,
    registry: Option<Arc<DashMap<SequenceId, OrderWatcher>>>,
    current: u32,
    paused: bool,
}

impl OrderTracker {
    /// Create a tracker drawing numbers from `generator`.
    #[must_use]
    pub fn new(generator: Arc<OrderNumberGenerator>) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            shared: Arc::new(Shared {
                sequence_id: SequenceId::next(),
                unprocessed: AtomicU32::new(0),
                progress,
            }),
            generator,
            registry: None,
            current: 0,
            paused: false,
        }
    }

    pub(crate) fn registered(
        generator: Arc<OrderNumberGenerator>,
        registry: Arc<DashMap<SequenceId, OrderWatcher>>,
    ) -> Self {
        let mut tracker = Self::new(generator);
        registry.insert(tracker.sequence_id(), tracker.watcher());
        tracker.registry = Some(registry);
        tracker
    }

    /// Identifier of this tracker in the sync point registry.
    #[must_use]
    pub fn sequence_id(&self) -> SequenceId {
        self.shared.sequence_id
    }

    /// A read-only view of this tracker's progress.
    #[must_use]
    pub fn watcher(&self) -> OrderWatcher {
        OrderWatcher { shared: Arc::clone(&self.shared), progress: self.shared.progress.subscribe() }
    }

    /// Issue the next order number for a newly accepted message.
    pub fn generate_unprocessed_order_number(&self) -> u32 {
        assert!(!self.is_destroyed(), "order number generated on destroyed tracker");
        let order_number = self.generator.generate();
        self.shared.unprocessed.store(order_number, Ordering::Release);
        trace!(sequence = %self.sequence_id(), order_number, "Generated order number");
        order_number
    }

    /// Start or resume processing `order_number`.
    pub fn begin_processing(&mut self, order_number: u32) {
        assert!(!self.is_destroyed(), "order number {order_number} begun on destroyed tracker");
        assert!(
            order_number >= self.current,
            "order number {order_number} begun after {}",
            self.current
        );
        assert!(
            order_number > self.processed(),
            "order number {order_number} already processed"
        );
        self.current = order_number;
        self.paused = false;
    }

    /// Stop processing the current order number without completing it.
    pub fn pause_processing(&mut self, order_number: u32) {
        assert!(!self.is_destroyed(), "order number {order_number} paused on destroyed tracker");
        assert_eq!(order_number, self.current, "paused order number is not current");
        assert!(!self.paused, "order number {order_number} paused twice");
        self.paused = true;
    }

    /// Mark the current order number as fully processed and wake waiters.
    pub fn finish_processing(&mut self, order_number: u32) {
        assert!(!self.is_destroyed(), "order number {order_number} finished on destroyed tracker");
        assert_eq!(order_number, self.current, "finished order number is not current");
        assert!(!self.paused, "order number {order_number} finished while paused");
        self.shared.progress.send_modify(|progress| progress.processed = order_number);
    }

    /// Tear the tracker down; waiters fail with [`OrderError::Destroyed`].
    pub fn destroy(&mut self) {
        assert!(!self.is_destroyed(), "order tracker destroyed twice");
        self.shared.progress.send_modify(|progress| progress.destroyed = true);
        if let Some(registry) = self.registry.take() {
            registry.remove(&self.sequence_id());
        }
    }

    /// Highest order number handed out.
    #[must_use]
    pub fn unprocessed_order_num(&self) -> u32 {
        self.shared.unprocessed.load(Ordering::Acquire)
    }

    /// Highest order number finished.
    #[must_use]
    pub fn processed(&self) -> u32 {
        self.shared.progress.borrow().processed
    }

    /// Order number currently begun, paused or finished last.
    #[must_use]
    pub const fn current(&self) -> u32 {
        self.current
    }

    /// Whether the current order number is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.shared.progress.borrow().destroyed
    }
}

/// Cloneable read-only view of one tracker.
#[derive(Debug, Clone)]
pub struct OrderWatcher {
    shared: Arc<Shared>,
    progress: watch::Receiver<Progress>,
}

impl OrderWatcher {
    #[must_use]
    pub fn sequence_id(&self) -> SequenceId {
        self.shared.sequence_id
    }

    /// Highest order number handed out.
    #[must_use]
    pub fn unprocessed(&self) -> u32 {
        self.shared.unprocessed.load(Ordering::Acquire)
    }

    /// Highest order number finished.
    #[must_use]
    pub fn processed(&self) -> u32 {
        self.progress.borrow().processed
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.progress.borrow().destroyed
    }

    /// Resolve once `order_number` has been processed.
    ///
    /// # Errors
    /// [`OrderError::NotIssued`] if the number was never handed out by this
    /// tracker, [`OrderError::Destroyed`] if the tracker goes away first.
    pub async fn wait_for_processed(&self, order_number: u32) -> Result<(), OrderError> {
        let latest = self.unprocessed();
        if order_number > latest && self.processed() < order_number {
            return Err(OrderError::NotIssued { order_number, latest });
        }

        let mut progress = self.progress.clone();
        loop {
            {
                let state = progress.borrow_and_update();
                if state.processed >= order_number {
                    return Ok(());
                }
                if state.destroyed {
                    return Err(OrderError::Destroyed { sequence_id: self.sequence_id() });
                }
            }
            if progress.changed().await.is_err() {
                return Err(OrderError::Destroyed { sequence_id: self.sequence_id() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> OrderTracker {
        OrderTracker::new(Arc::new(OrderNumberGenerator::new()))
    }

    #[test]
    fn test_generator_is_monotonic() {
        let generator = OrderNumberGenerator::new();
        assert_eq!(generator.peek(), 1);
        assert_eq!(generator.generate(), 1);
        assert_eq!(generator.generate(), 2);
        assert_eq!(generator.peek(), 3);
    }

    #[test]
    fn test_begin_pause_resume_finish() {
        let mut tracker = tracker();
        let n = tracker.generate_unprocessed_order_number();

        tracker.begin_processing(n);
        tracker.pause_processing(n);
        assert!(tracker.is_paused());
        assert_eq!(tracker.processed(), 0);

        tracker.begin_processing(n);
        assert!(!tracker.is_paused());
        tracker.finish_processing(n);
        assert_eq!(tracker.processed(), n);
        assert_eq!(tracker.unprocessed_order_num(), n);
    }

    #[test]
    #[should_panic(expected = "already processed")]
    fn test_begin_processed_number_panics() {
        let mut tracker = tracker();
        let n = tracker.generate_unprocessed_order_number();
        tracker.begin_processing(n);
        tracker.finish_processing(n);
        tracker.begin_processing(n);
    }

    #[test]
    #[should_panic(expected = "finished while paused")]
    fn test_finish_while_paused_panics() {
        let mut tracker = tracker();
        let n = tracker.generate_unprocessed_order_number();
        tracker.begin_processing(n);
        tracker.pause_processing(n);
        tracker.finish_processing(n);
    }

    #[test]
    #[should_panic(expected = "destroyed twice")]
    fn test_double_destroy_panics() {
        let mut tracker = tracker();
        tracker.destroy();
        tracker.destroy();
    }

    #[test]
    #[should_panic(expected = "begun on destroyed tracker")]
    fn test_begin_after_destroy_panics() {
        let mut tracker = tracker();
        let order_number = tracker.generate_unprocessed_order_number();
        tracker.destroy();
        tracker.begin_processing(order_number);
    }

    #[test]
    #[should_panic(expected = "paused on destroyed tracker")]
    fn test_pause_after_destroy_panics() {
        let mut tracker = tracker();
        let order_number = tracker.generate_unprocessed_order_number();
        tracker.begin_processing(order_number);
        tracker.destroy();
        tracker.pause_processing(order_number);
    }

    #[test]
    #[should_panic(expected = "finished on destroyed tracker")]
    fn test_finish_after_destroy_panics() {
        let mut tracker = tracker();
        let order_number = tracker.generate_unprocessed_order_number();
        tracker.begin_processing(order_number);
        tracker.destroy();
        tracker.finish_processing(order_number);
    }

    #[test]
    fn test_destroyed_tracker_keeps_progress() {
        let mut tracker = tracker();
        let order_number = tracker.generate_unprocessed_order_number();
        let watcher = tracker.watcher();
        tracker.destroy();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracker.begin_processing(order_number);
            tracker.finish_processing(order_number);
        }));
        assert!(result.is_err());
        assert_eq!(watcher.processed(), 0);
    }

    #[test]
    fn test_generator_reaches_max_minus_one() {
        let generator = OrderNumberGenerator { next: AtomicU32::new(u32::MAX - 1) };
        assert_eq!(generator.generate(), u32::MAX - 1);
        assert_eq!(generator.peek(), u32::MAX);
    }

    #[test]
    #[should_panic(expected = "order numbers exhausted")]
    fn test_generator_never_wraps() {
        let generator = OrderNumberGenerator { next: AtomicU32::new(u32::MAX) };
        generator.generate();
    }

    #[tokio::test]
    async fn test_wait_for_processed_resolves() {
        let mut tracker = tracker();
        let first = tracker.generate_unprocessed_order_number();
        let second = tracker.generate_unprocessed_order_number();
        let watcher = tracker.watcher();

        let waiter = tokio::spawn(async move { watcher.wait_for_processed(second).await });
        tokio::task::yield_now().await;

        tracker.begin_processing(first);
        tracker.finish_processing(first);
        tracker.begin_processing(second);
        tracker.finish_processing(second);

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_wait_fails_when_destroyed() {
        let mut tracker = tracker();
        let n = tracker.generate_unprocessed_order_number();
        let watcher = tracker.watcher();

        let waiter = tokio::spawn(async move { watcher.wait_for_processed(n).await });
        tokio::task::yield_now().await;
        tracker.destroy();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(OrderError::Destroyed { .. })));
    }

    #[tokio::test]
    async fn test_wait_for_unissued_number() {
        let tracker = tracker();
        let n = tracker.generate_unprocessed_order_number();
        let result = tracker.watcher().wait_for_processed(n + 10).await;
        assert_eq!(result, Err(OrderError::NotIssued { order_number: n + 10, latest: n }));
    }
}
