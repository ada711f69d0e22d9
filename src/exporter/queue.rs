use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::window::WindowRecord;

/// What to discard when the delivery queue is full
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the oldest waiting record to make room
    #[default]
    DropOldest,
    /// Discard the incoming record
    DropNewest,
}

/// A record waiting for delivery
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub record: Arc<WindowRecord>,
    /// Delivery attempts made so far
    pub attempts: u32,
    /// Not eligible for delivery before this instant
    pub ready_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<QueueEntry>,
    /// Entries taken by the delivery loop and not yet completed or requeued
    in_flight: usize,
}

/// Bounded queue between the windower and the delivery loop
///
/// In-flight entries count against the capacity so a requeue after a failed
/// delivery never overflows it.
#[derive(Debug)]
pub struct DeliveryQueue {
    capacity: usize,
    policy: EvictionPolicy,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DeliveryQueue {
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        Self {
            capacity,
            policy,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a record, returning the record evicted to stay within capacity
    pub fn push(&self, record: Arc<WindowRecord>) -> Option<Arc<WindowRecord>> {
        let entry = QueueEntry {
            record,
            attempts: 0,
            ready_at: Instant::now(),
        };

        let evicted = {
            let mut state = self.state.lock();
            if state.waiting.len() + state.in_flight < self.capacity {
                state.waiting.push_back(entry);
                None
            } else {
                match self.policy {
                    // Everything may be in flight, leaving nothing to evict
                    EvictionPolicy::DropOldest => match state.waiting.pop_front() {
                        Some(oldest) => {
                            state.waiting.push_back(entry);
                            Some(oldest.record)
                        }
                        None => Some(entry.record),
                    },
                    EvictionPolicy::DropNewest => Some(entry.record),
                }
            }
        };

        self.notify.notify_one();
        evicted
    }

    /// Take up to `max` entries that are ready at `now`, oldest first
    pub fn take_ready(&self, now: Instant, max: usize) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        let mut taken = Vec::new();
        let mut rest = VecDeque::with_capacity(state.waiting.len());
        for entry in state.waiting.drain(..) {
            if taken.len() < max && entry.ready_at <= now {
                taken.push(entry);
            } else {
                rest.push_back(entry);
            }
        }
        state.waiting = rest;
        state.in_flight += taken.len();
        taken
    }

    /// Release in-flight slots of entries that are done with
    pub fn complete(&self, n: usize) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(n);
    }

    /// Return in-flight entries to the front of the queue, keeping their order
    pub fn requeue(&self, entries: Vec<QueueEntry>) {
        if entries.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(entries.len());
            for entry in entries.into_iter().rev() {
                state.waiting.push_front(entry);
            }
        }
        self.notify.notify_one();
    }

    /// Earliest instant at which a waiting entry becomes ready
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.state.lock().waiting.iter().map(|e| e.ready_at).min()
    }

    /// Entries waiting for delivery
    pub fn len(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().waiting.is_empty()
    }

    /// Waiting plus in-flight entries
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.waiting.len() + state.in_flight
    }

    /// Wait until something is pushed or requeued
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Metric, ProbeKind, SeriesKey};
    use crate::window::WindowSpec;
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::time::Duration;

    /// A record whose window starts `n` windows after a fixed instant
    fn record(n: i64) -> Arc<WindowRecord> {
        let spec = WindowSpec::new(Duration::from_secs(3)).unwrap();
        let start = Utc.timestamp_opt(1_700_000_001, 0).unwrap() + TimeDelta::seconds(3 * n);
        Arc::new(WindowRecord::aggregate(
            SeriesKey::new("edge", Metric::IcmpRtt),
            "192.0.2.1".into(),
            ProbeKind::Ping,
            spec.window_of(start),
            &[],
            &[],
        ))
    }

    fn start_of(record: &WindowRecord) -> i64 {
        record.window.start.timestamp()
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let queue = DeliveryQueue::new(10, EvictionPolicy::DropOldest);
        let evicted: Vec<_> = (0..15).filter_map(|n| queue.push(record(n))).collect();

        assert_eq!(evicted.len(), 5);
        let evicted_starts: Vec<_> = evicted.iter().map(|r| start_of(r)).collect();
        let expected: Vec<_> = (0..5).map(|n| start_of(&record(n))).collect();
        assert_eq!(evicted_starts, expected);

        let remaining = queue.take_ready(Instant::now(), usize::MAX);
        let starts: Vec<_> = remaining.iter().map(|e| start_of(&e.record)).collect();
        let expected: Vec<_> = (5..15).map(|n| start_of(&record(n))).collect();
        assert_eq!(starts, expected);
    }

    #[tokio::test]
    async fn test_drop_newest_rejects_incoming() {
        let queue = DeliveryQueue::new(2, EvictionPolicy::DropNewest);
        assert!(queue.push(record(0)).is_none());
        assert!(queue.push(record(1)).is_none());
        let rejected = queue.push(record(2)).unwrap();
        assert_eq!(start_of(&rejected), start_of(&record(2)));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_counts_against_capacity() {
        let queue = DeliveryQueue::new(2, EvictionPolicy::DropOldest);
        queue.push(record(0));
        queue.push(record(1));
        let taken = queue.take_ready(Instant::now(), 2);
        assert_eq!(queue.pending(), 2);

        // Nothing waiting to evict, so the newcomer is the one dropped
        assert!(queue.push(record(2)).is_some());

        queue.requeue(taken);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_ready_respects_retry_instant() {
        let queue = DeliveryQueue::new(4, EvictionPolicy::DropOldest);
        queue.push(record(0));
        queue.push(record(1));

        let mut taken = queue.take_ready(Instant::now(), 1);
        let later = Instant::now() + Duration::from_secs(5);
        taken[0].attempts = 1;
        taken[0].ready_at = later;
        queue.requeue(taken);

        // The retried entry sits at the front but is not ready yet
        let ready = queue.take_ready(Instant::now(), 4);
        assert_eq!(ready.len(), 1);
        assert_eq!(start_of(&ready[0].record), start_of(&record(1)));
        queue.complete(ready.len());

        assert_eq!(queue.next_ready_at(), Some(later));
        let retried = queue.take_ready(later, 4);
        assert_eq!(retried[0].attempts, 1);
    }
}
