//! Order number properties across trackers sharing one sync point manager.

use gpuchan_core::{OrderError, SyncPointManager};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Step {
    Push(usize),
    Pause(usize),
    Finish(usize),
}

fn step_strategy(streams: usize) -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..streams).prop_map(Step::Push),
        (0..streams).prop_map(Step::Pause),
        (0..streams).prop_map(Step::Finish),
    ]
}

proptest! {
    /// Every stream sees strictly increasing order numbers and never reports
    /// more processed than issued, whatever the interleaving.
    #[test]
    fn order_numbers_stay_monotonic(steps in prop::collection::vec(step_strategy(3), 1..200)) {
        let manager = SyncPointManager::new();
        let mut trackers: Vec<_> = (0..3).map(|_| manager.create_tracker()).collect();
        let mut pending: Vec<std::collections::VecDeque<u32>> = vec![Default::default(); 3];
        let mut last_issued = [0u32; 3];

        for step in steps {
            match step {
                Step::Push(i) => {
                    let n = trackers[i].generate_unprocessed_order_number();
                    prop_assert!(n > last_issued[i]);
                    last_issued[i] = n;
                    pending[i].push_back(n);
                },
                Step::Pause(i) => {
                    if let Some(&head) = pending[i].front() {
                        trackers[i].begin_processing(head);
                        trackers[i].pause_processing(head);
                        prop_assert!(trackers[i].processed() < head);
                    }
                },
                Step::Finish(i) => {
                    if let Some(head) = pending[i].pop_front() {
                        trackers[i].begin_processing(head);
                        trackers[i].finish_processing(head);
                        prop_assert_eq!(trackers[i].processed(), head);
                    }
                },
            }

            for tracker in &trackers {
                prop_assert!(tracker.processed() <= tracker.unprocessed_order_num());
            }
        }
    }
}

#[tokio::test]
async fn test_waiter_released_by_later_stream_progress() {
    let manager = SyncPointManager::new();
    let mut tracker = manager.create_tracker();
    let sequence = tracker.sequence_id();

    let numbers: Vec<u32> = (0..3).map(|_| tracker.generate_unprocessed_order_number()).collect();
    let watcher = manager.order_watcher(sequence).unwrap();
    let last = numbers[2];
    let waiter = tokio::spawn(async move { watcher.wait_for_processed(last).await });

    for n in numbers {
        tracker.begin_processing(n);
        tracker.finish_processing(n);
        tokio::task::yield_now().await;
    }

    assert_eq!(waiter.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_destroyed_tracker_is_unknown_to_manager() {
    let manager = SyncPointManager::new();
    let mut tracker = manager.create_tracker();
    let sequence = tracker.sequence_id();
    let n = tracker.generate_unprocessed_order_number();
    tracker.destroy();

    assert_eq!(
        manager.wait_for_order(sequence, n).await,
        Err(OrderError::UnknownSequence { sequence_id: sequence })
    );
}
