//! Watermark invariants under random client churn

use std::collections::BTreeMap;

use proptest::prelude::*;
use tandem_core::{ClientId, SequenceNumber};
use tandem_protocol::WatermarkTracker;

#[derive(Debug, Clone)]
enum Event {
    Sequence(u64),
    Join { client: usize, lag: u64 },
    Update { client: usize, lag: u64 },
    Leave { client: usize },
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => (1..4u64).prop_map(Event::Sequence),
        2 => (0..4usize, 0..6u64).prop_map(|(client, lag)| Event::Join { client, lag }),
        4 => (0..4usize, 0..6u64).prop_map(|(client, lag)| Event::Update { client, lag }),
        1 => (0..4usize).prop_map(|client| Event::Leave { client }),
    ]
}

fn client(index: usize) -> ClientId {
    ClientId::new(format!("client-{index}"))
}

proptest! {
    #[test]
    fn watermark_is_monotonic_and_bounded(events in prop::collection::vec(event(), 1..120)) {
        let mut tracker = WatermarkTracker::new();
        let mut head: SequenceNumber = 0;
        // Effective reference of every connected client
        let mut connected: BTreeMap<usize, SequenceNumber> = BTreeMap::new();
        let mut previous = 0;

        for event in events {
            match event {
                Event::Sequence(count) => head += count,
                Event::Join { client: index, lag } => {
                    if connected.contains_key(&index) {
                        continue;
                    }
                    let reference = head.saturating_sub(lag);
                    tracker.join(client(index), reference);
                    connected.insert(index, reference.max(tracker.minimum()));
                }
                Event::Update { client: index, lag } => {
                    let reference = head.saturating_sub(lag);
                    let result = tracker.update(&client(index), reference);
                    match connected.get_mut(&index) {
                        Some(current) => {
                            prop_assert!(result.is_ok());
                            *current = (*current).max(reference);
                        }
                        None => prop_assert!(result.is_err()),
                    }
                }
                Event::Leave { client: index } => {
                    prop_assert_eq!(tracker.leave(&client(index)), connected.remove(&index).is_some());
                }
            }

            let minimum = tracker.advance(head);
            prop_assert!(minimum >= previous);
            prop_assert!(minimum <= head);
            match connected.values().min() {
                Some(lowest) => prop_assert!(minimum <= *lowest),
                None => prop_assert_eq!(minimum, head),
            }
            prop_assert_eq!(tracker.client_count(), connected.len());
            previous = minimum;
        }
    }
}
