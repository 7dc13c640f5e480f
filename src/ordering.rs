//! Out-of-order event buffer
//!
//! `OrderedEventBuffer` keeps every received event in arrival order and
//! derives a sorted view on demand. Arrival history is never rewritten, so
//! receipt order and logical order can be compared after the fact.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One received event with its ordering key and arrival sequence
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedEvent<K, T> {
    /// Logical position among events of the same correlation scope
    pub ordering_key: K,

    /// Business payload
    pub payload: T,

    /// Buffer-assigned receipt sequence, starting at 0
    pub arrival: u64,
}

/// Thread-safe buffer that re-sequences events by ordering key
///
/// `receive` appends under a write lock. Views clone a snapshot under the
/// read lock and sort outside it; events received after the snapshot is
/// taken are not included.
pub struct OrderedEventBuffer<K, T> {
    events: RwLock<Vec<OrderedEvent<K, T>>>,
}

impl<K, T> Default for OrderedEventBuffer<K, T> {
    fn default() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }
}

impl<K, T> OrderedEventBuffer<K, T>
where
    K: Ord + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event; never rejects and never deduplicates
    pub fn receive(&self, ordering_key: K, payload: T) {
        let mut events = self.write();
        let arrival = events.len() as u64;
        events.push(OrderedEvent {
            ordering_key,
            payload,
            arrival,
        });
    }

    /// Append a pre-built event, re-stamping its arrival sequence
    pub fn receive_event(&self, event: OrderedEvent<K, T>) {
        self.receive(event.ordering_key, event.payload);
    }

    /// Payloads sorted by ordering key, ties kept in arrival order
    pub fn ordered_view(&self) -> Vec<T> {
        self.ordered_events()
            .into_iter()
            .map(|e| e.payload)
            .collect()
    }

    /// Payloads in raw receipt order
    pub fn arrival_view(&self) -> Vec<T> {
        self.read().iter().map(|e| e.payload.clone()).collect()
    }

    /// Full event snapshots sorted by ordering key (stable)
    pub fn ordered_events(&self) -> Vec<OrderedEvent<K, T>> {
        let mut snapshot = self.read().clone();
        snapshot.sort_by(|a, b| a.ordering_key.cmp(&b.ordering_key));
        snapshot
    }

    /// Ordered payloads whose key is at or below `bound`
    ///
    /// Useful for replaying a run that is safe to emit downstream once a
    /// watermark has passed. Nothing is removed from the buffer.
    pub fn ordered_until(&self, bound: &K) -> Vec<T> {
        self.ordered_events()
            .into_iter()
            .take_while(|e| e.ordering_key <= *bound)
            .map(|e| e.payload)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // Poisoned guards are recovered: a push is never observed half-applied.
    fn read(&self) -> RwLockReadGuard<'_, Vec<OrderedEvent<K, T>>> {
        self.events.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<OrderedEvent<K, T>>> {
        self.events.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    #[test]
    fn test_empty_buffer() {
        let buffer: OrderedEventBuffer<u64, &str> = OrderedEventBuffer::new();
        assert!(buffer.is_empty());
        assert!(buffer.ordered_view().is_empty());
        assert!(buffer.arrival_view().is_empty());
    }

    #[test]
    fn test_swapped_timestamps_are_reordered() {
        let t0 = Utc::now();
        let buffer = OrderedEventBuffer::new();

        buffer.receive(t0, "takeoff");
        buffer.receive(t0 - Duration::seconds(1000), "boarding_completed");
        buffer.receive(t0 - Duration::seconds(100), "taxi_started");

        assert_eq!(
            buffer.arrival_view(),
            vec!["takeoff", "boarding_completed", "taxi_started"]
        );
        assert_eq!(
            buffer.ordered_view(),
            vec!["boarding_completed", "taxi_started", "takeoff"]
        );
        // Ordering did not rewrite history
        assert_eq!(buffer.arrival_view()[0], "takeoff");
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let buffer = OrderedEventBuffer::new();
        buffer.receive(2, "b1");
        buffer.receive(1, "a");
        buffer.receive(2, "b2");
        buffer.receive(2, "b3");

        assert_eq!(buffer.ordered_view(), vec!["a", "b1", "b2", "b3"]);
    }

    #[test]
    fn test_duplicates_are_kept() {
        let buffer = OrderedEventBuffer::new();
        buffer.receive(1, "same");
        buffer.receive(1, "same");
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_ordered_view_is_live_snapshot() {
        let buffer = OrderedEventBuffer::new();
        buffer.receive(5, 'e');
        assert_eq!(buffer.ordered_view(), vec!['e']);

        buffer.receive(1, 'a');
        assert_eq!(buffer.ordered_view(), vec!['a', 'e']);
        assert_eq!(buffer.ordered_view(), vec!['a', 'e']);
    }

    #[test]
    fn test_ordered_view_matches_stable_sort_of_arrivals() {
        let keys = [7u32, 3, 9, 3, 1, 7, 0, 9, 4];
        let buffer = OrderedEventBuffer::new();
        for (i, k) in keys.iter().enumerate() {
            buffer.receive(*k, (*k, i));
        }

        let mut expected = buffer.arrival_view();
        expected.sort_by_key(|(k, _)| *k);
        assert_eq!(buffer.ordered_view(), expected);

        let arrivals: Vec<usize> = buffer.arrival_view().iter().map(|(_, i)| *i).collect();
        assert_eq!(arrivals, (0..keys.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_ordered_events_carry_arrival_sequence() {
        let buffer = OrderedEventBuffer::new();
        buffer.receive(20, "late");
        buffer.receive(10, "early");

        let events = buffer.ordered_events();
        assert_eq!(events[0].payload, "early");
        assert_eq!(events[0].arrival, 1);
        assert_eq!(events[1].arrival, 0);
    }

    #[test]
    fn test_receive_event_restamps_arrival() {
        let buffer = OrderedEventBuffer::new();
        buffer.receive(1, "first");
        buffer.receive_event(OrderedEvent {
            ordering_key: 0,
            payload: "second",
            arrival: 99,
        });

        let events = buffer.ordered_events();
        assert_eq!(events[0].payload, "second");
        assert_eq!(events[0].arrival, 1);
    }

    #[test]
    fn test_ordered_until_bound() {
        let buffer = OrderedEventBuffer::new();
        for k in [30, 10, 50, 20, 40] {
            buffer.receive(k, k);
        }

        assert_eq!(buffer.ordered_until(&30), vec![10, 20, 30]);
        assert_eq!(buffer.ordered_until(&5), Vec::<i32>::new());
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_concurrent_receive() {
        let buffer = Arc::new(OrderedEventBuffer::new());
        let mut handles = Vec::new();
        for worker in 0..8u64 {
            let buffer = buffer.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    buffer.receive(worker * 1000 + i, (worker, i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(buffer.len(), 800);
        let ordered = buffer.ordered_view();
        assert_eq!(ordered.first(), Some(&(0, 0)));
        assert_eq!(ordered.last(), Some(&(7, 99)));
        assert!(ordered.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Each writer's events seen in a snapshot must be exactly its first `n`
    fn assert_writer_prefixes(items: &[(u64, u64)], writers: u64) {
        for writer in 0..writers {
            let mut seen: Vec<u64> = items
                .iter()
                .filter(|(w, _)| *w == writer)
                .map(|(_, i)| *i)
                .collect();
            seen.sort_unstable();
            assert!(seen.iter().copied().eq(0..seen.len() as u64));
        }
    }

    #[test]
    fn test_snapshots_consistent_during_concurrent_receive() {
        const WRITERS: u64 = 4;
        const PER_WRITER: u64 = 200;

        let buffer = Arc::new(OrderedEventBuffer::new());
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        // Descending keys so every arrival lands ahead of the last
                        let key = (PER_WRITER - i) * WRITERS + writer;
                        buffer.receive(key, (writer, i));
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = buffer.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut snapshots = 0usize;
                    loop {
                        let finished = done.load(std::sync::atomic::Ordering::SeqCst);

                        let events = buffer.ordered_events();
                        assert!(events
                            .windows(2)
                            .all(|w| w[0].ordering_key <= w[1].ordering_key));
                        let payloads: Vec<_> = events.iter().map(|e| e.payload).collect();
                        assert_writer_prefixes(&payloads, WRITERS);

                        let ordered = buffer.ordered_view();
                        assert_writer_prefixes(&ordered, WRITERS);

                        let arrived = buffer.arrival_view();
                        for writer in 0..WRITERS {
                            // Arrival view keeps each writer's own sequence
                            let sequence: Vec<u64> = arrived
                                .iter()
                                .filter(|(w, _)| *w == writer)
                                .map(|(_, i)| *i)
                                .collect();
                            assert!(sequence.iter().copied().eq(0..sequence.len() as u64));
                        }

                        snapshots += 1;
                        if finished {
                            return snapshots;
                        }
                    }
                })
            })
            .collect();

        for h in writers {
            h.join().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        for h in readers {
            assert!(h.join().unwrap() > 0);
        }

        let total = (WRITERS * PER_WRITER) as usize;
        assert_eq!(buffer.len(), total);
        let ordered = buffer.ordered_view();
        assert_eq!(ordered.len(), total);
        assert_eq!(ordered.first(), Some(&(0, PER_WRITER - 1)));
        assert_eq!(ordered.last(), Some(&(WRITERS - 1, 0)));
    }
}
