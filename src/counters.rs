//! Pipeline-wide counters.
//!
//! Every event the pipeline absorbs instead of failing (late samples, skipped
//! ticks, evictions, give-ups) is counted here so it is never silent.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters, updated with relaxed atomics from any task
#[derive(Debug, Default)]
pub struct Counters {
    samples: AtomicU64,
    late_samples: AtomicU64,
    unrouted_samples: AtomicU64,
    skipped_ticks: AtomicU64,
    abandoned_probes: AtomicU64,
    windows_emitted: AtomicU64,
    delivered_records: AtomicU64,
    dropped_records: AtomicU64,
    failed_records: AtomicU64,
    rejected_records: AtomicU64,
    delivery_retries: AtomicU64,
}

/// Point-in-time copy of [`Counters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub samples: u64,
    pub late_samples: u64,
    pub unrouted_samples: u64,
    pub skipped_ticks: u64,
    pub abandoned_probes: u64,
    pub windows_emitted: u64,
    pub delivered_records: u64,
    /// Records evicted from a full delivery queue
    pub dropped_records: u64,
    /// Records given up on after exhausting their delivery attempts
    pub failed_records: u64,
    /// Records the sink refused permanently
    pub rejected_records: u64,
    pub delivery_retries: u64,
}

macro_rules! counter {
    ($inc:ident, $add:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(inc_samples, add_samples, samples, samples);
    counter!(inc_late_samples, add_late_samples, late_samples, late_samples);
    counter!(inc_unrouted_samples, add_unrouted_samples, unrouted_samples, unrouted_samples);
    counter!(inc_skipped_ticks, add_skipped_ticks, skipped_ticks, skipped_ticks);
    counter!(inc_abandoned_probes, add_abandoned_probes, abandoned_probes, abandoned_probes);
    counter!(inc_windows_emitted, add_windows_emitted, windows_emitted, windows_emitted);
    counter!(inc_delivered_records, add_delivered_records, delivered_records, delivered_records);
    counter!(inc_dropped_records, add_dropped_records, dropped_records, dropped_records);
    counter!(inc_failed_records, add_failed_records, failed_records, failed_records);
    counter!(inc_rejected_records, add_rejected_records, rejected_records, rejected_records);
    counter!(inc_delivery_retries, add_delivery_retries, delivery_retries, delivery_retries);

    /// Copy every counter
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            samples: self.samples(),
            late_samples: self.late_samples(),
            unrouted_samples: self.unrouted_samples(),
            skipped_ticks: self.skipped_ticks(),
            abandoned_probes: self.abandoned_probes(),
            windows_emitted: self.windows_emitted(),
            delivered_records: self.delivered_records(),
            dropped_records: self.dropped_records(),
            failed_records: self.failed_records(),
            rejected_records: self.rejected_records(),
            delivery_retries: self.delivery_retries(),
        }
    }
}

impl std::fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "samples={} late={} unrouted={} skipped_ticks={} abandoned={} windows={} \
             delivered={} dropped={} failed={} rejected={} retries={}",
            self.samples,
            self.late_samples,
            self.unrouted_samples,
            self.skipped_ticks,
            self.abandoned_probes,
            self.windows_emitted,
            self.delivered_records,
            self.dropped_records,
            self.failed_records,
            self.rejected_records,
            self.delivery_retries
        )
    }
}
