use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::counters::Counters;
use crate::probe::{ProbeKind, Sample, SeriesKey};
use crate::window::{Window, WindowSpec};

/// Empty windows further back than this are not emitted when the clock jumps
const MAX_CATCH_UP_WINDOWS: i32 = 100;

/// What happened to a pushed sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered for the window that contains its timestamp
    Accepted,
    /// Its window was already closed; dropped and counted
    Late,
}

/// Samples drained from one closed window
#[derive(Debug)]
pub struct DrainedWindow {
    pub window: Window,
    pub samples: Vec<Sample>,
}

struct BufferState {
    /// Every window ending at or before this instant is closed
    closed_until: DateTime<Utc>,
    /// Open windows with at least one sample, keyed by start
    open: BTreeMap<DateTime<Utc>, Vec<Sample>>,
    /// Late samples since the last close, for logging
    late_since_close: u64,
}

/// Collector of raw samples for one (target, metric) series
///
/// Writers and the windower share one short critical section: a push appends
/// to the vector of the sample's window, a close moves whole vectors out of
/// the map. Neither depends on how many samples are buffered.
pub struct SampleBuffer {
    key: SeriesKey,
    host: Arc<str>,
    probe: ProbeKind,
    spec: WindowSpec,
    state: Mutex<BufferState>,
    counters: Arc<Counters>,
}

impl SampleBuffer {
    /// Create a buffer whose first open window contains `opened_at`
    pub fn new(
        key: SeriesKey,
        host: impl Into<Arc<str>>,
        probe: ProbeKind,
        spec: WindowSpec,
        opened_at: DateTime<Utc>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            key,
            host: host.into(),
            probe,
            spec,
            state: Mutex::new(BufferState {
                closed_until: spec.start_of(opened_at),
                open: BTreeMap::new(),
                late_since_close: 0,
            }),
            counters,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn host(&self) -> &Arc<str> {
        &self.host
    }

    pub fn probe(&self) -> ProbeKind {
        self.probe
    }

    /// Start of the oldest window that is still open
    pub fn closed_until(&self) -> DateTime<Utc> {
        self.state.lock().closed_until
    }

    /// Add a sample to the window containing its timestamp
    pub fn push(&self, sample: Sample) -> PushOutcome {
        let start = self.spec.start_of(sample.timestamp);

        let mut state = self.state.lock();
        if sample.timestamp < state.closed_until {
            state.late_since_close += 1;
            drop(state);
            self.counters.inc_late_samples();
            trace!("{}: late sample at {} dropped", self.key, sample.timestamp);
            return PushOutcome::Late;
        }
        state.open.entry(start).or_default().push(sample);
        drop(state);

        self.counters.inc_samples();
        PushOutcome::Accepted
    }

    /// Close every window ending at or before `boundary`, oldest first
    ///
    /// Empty windows are included so that "no data" is reported. A window is
    /// returned by at most one call; afterwards samples for it are late.
    pub fn close_until(&self, boundary: DateTime<Utc>) -> Vec<DrainedWindow> {
        let boundary = self.spec.start_of(boundary);

        let (from, due, late) = {
            let mut state = self.state.lock();
            if boundary <= state.closed_until {
                return Vec::new();
            }
            let later = state.open.split_off(&boundary);
            let due = std::mem::replace(&mut state.open, later);
            let from = std::mem::replace(&mut state.closed_until, boundary);
            let late = std::mem::take(&mut state.late_since_close);
            (from, due, late)
        };

        if late > 0 {
            warn!("{}: dropped {} late sample(s) before {}", self.key, late, from);
        }

        let catch_up = boundary - self.spec.duration() * MAX_CATCH_UP_WINDOWS;
        let mut empty_from = from;
        if catch_up > from {
            debug!(
                "{}: skipping empty windows between {} and {}",
                self.key, from, catch_up
            );
            empty_from = self.spec.start_of(catch_up);
        }

        let mut drained = Vec::new();
        let mut due = due.into_iter().peekable();
        let mut start = empty_from;
        loop {
            // Windows holding samples come first if they precede the next empty one
            while let Some((window_start, _)) = due.peek() {
                if *window_start > start {
                    break;
                }
                if let Some((window_start, samples)) = due.next() {
                    drained.push(DrainedWindow {
                        window: self.spec.window_at(window_start),
                        samples,
                    });
                    if window_start == start {
                        start += self.spec.duration();
                    }
                }
            }
            if start >= boundary {
                break;
            }
            drained.push(DrainedWindow {
                window: self.spec.window_at(start),
                samples: Vec::new(),
            });
            start += self.spec.duration();
        }
        drained
    }

    /// Close every open window, including the current one and any later one
    /// that already holds samples
    pub fn close_all(&self, now: DateTime<Utc>) -> Vec<DrainedWindow> {
        let current_end = self.spec.window_of(now).end;
        let last_end = {
            let state = self.state.lock();
            state
                .open
                .keys()
                .next_back()
                .map(|start| self.spec.window_at(*start).end)
        };
        let boundary = last_end.map_or(current_end, |end| end.max(current_end));
        self.close_until(boundary)
    }
}

/// The fixed set of series buffers, built once at startup
pub struct SeriesBuffers {
    buffers: BTreeMap<SeriesKey, Arc<SampleBuffer>>,
    counters: Arc<Counters>,
}

impl SeriesBuffers {
    pub fn new(buffers: impl IntoIterator<Item = SampleBuffer>, counters: Arc<Counters>) -> Self {
        Self {
            buffers: buffers
                .into_iter()
                .map(|buffer| (buffer.key().clone(), Arc::new(buffer)))
                .collect(),
            counters,
        }
    }

    pub fn get(&self, key: &SeriesKey) -> Option<&Arc<SampleBuffer>> {
        self.buffers.get(key)
    }

    /// All buffers, in key order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<SampleBuffer>> {
        self.buffers.values()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Hand a sample to the buffer of its series
    pub fn route(&self, sample: Sample) -> Option<PushOutcome> {
        match self.buffers.get(&sample.key) {
            Some(buffer) => Some(buffer.push(sample)),
            None => {
                warn!("No buffer registered for series {}", sample.key);
                self.counters.inc_unrouted_samples();
                None
            }
        }
    }

    /// Forward samples from the probe channel until cancelled, then drain
    /// whatever is already queued
    pub async fn run_router(self: Arc<Self>, mut rx: mpsc::Receiver<Sample>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                sample = rx.recv() => match sample {
                    Some(sample) => {
                        self.route(sample);
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    let mut drained = 0;
                    while let Ok(sample) = rx.try_recv() {
                        self.route(sample);
                        drained += 1;
                    }
                    debug!("Sample router stopping, routed {} queued sample(s)", drained);
                    break;
                }
            }
        }
    }
}
