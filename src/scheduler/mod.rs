//! Per-target measurement cadences.
//!
//! Every (target, probe) pair runs in its own task. A cadence awaits its own
//! probe, so runs for one target never overlap; ticks that pass while a probe
//! is still running are skipped and counted.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::counters::Counters;
use crate::probe::{self, Probe, Sample, Target};
use crate::window::Clock;

mod jitter;

pub use jitter::{JitterMode, delay_with, offset_with};

/// Timing of one cadence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CadenceConfig {
    /// Mean delay between measurement starts
    pub period: Duration,
    /// Randomisation as a fraction of the period, in `[0, 1)`
    pub jitter: f64,
    pub mode: JitterMode,
    /// Upper bound of a single measurement
    pub timeout: Duration,
}

impl CadenceConfig {
    /// Draw the delay until the next measurement
    pub fn next_delay(&self) -> Duration {
        delay_with(self.period, self.jitter, self.mode, rand::random())
    }

    /// Draw the offset of the first measurement
    pub fn initial_offset(&self) -> Duration {
        offset_with(self.period, self.jitter, rand::random())
    }
}

/// Everything a cadence task needs
pub struct CadenceSpec {
    pub target: Target,
    pub config: CadenceConfig,
    pub probe: Arc<dyn Probe>,
}

impl std::fmt::Debug for CadenceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CadenceSpec")
            .field("target", &self.target.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Running set of cadence tasks
pub struct Scheduler {
    tasks: Vec<(String, JoinHandle<()>)>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl Scheduler {
    /// Spawn one task per cadence
    pub fn start(
        specs: Vec<CadenceSpec>,
        tx: mpsc::Sender<Sample>,
        counters: Arc<Counters>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let tasks = specs
            .into_iter()
            .map(|spec| {
                let name = spec.target.name.clone();
                let handle = tokio::spawn(run_cadence(
                    spec,
                    tx.clone(),
                    Arc::clone(&counters),
                    Arc::clone(&clock),
                    cancel.clone(),
                ));
                (name, handle)
            })
            .collect::<Vec<_>>();
        info!("Scheduler started {} cadence(s)", tasks.len());

        Self {
            tasks,
            cancel,
            counters,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop launching probes and wait up to `grace` for running ones
    ///
    /// Cadences still busy after the grace period are detached and counted as
    /// abandoned; their eventual samples are discarded. Returns how many.
    pub async fn stop(self, grace: Duration) -> usize {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;

        let mut abandoned = 0;
        for (name, handle) in self.tasks {
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Cadence for '{}' ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Probe for '{}' still running after {:?}, abandoning it", name, grace);
                    abandoned += 1;
                }
            }
        }
        self.counters.add_abandoned_probes(abandoned as u64);
        debug!("Scheduler stopped, {} probe(s) abandoned", abandoned);
        abandoned
    }
}

/// Number of whole ticks of length `delay` missed when `now` is past `next`
fn missed_ticks(next: Instant, now: Instant, delay: Duration) -> u32 {
    if now <= next || delay.is_zero() {
        return 0;
    }
    let behind = now - next;
    u32::try_from(behind.as_nanos() / delay.as_nanos())
        .unwrap_or(u32::MAX)
        .saturating_add(1)
}

async fn run_cadence(
    spec: CadenceSpec,
    tx: mpsc::Sender<Sample>,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let CadenceSpec {
        target,
        config,
        probe,
    } = spec;
    let mut next = Instant::now() + config.initial_offset();
    debug!("Cadence for '{}' ({}) starting", target.name, probe.kind());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(next) => {}
        }
        if cancel.is_cancelled() {
            break;
        }

        let sample = probe::run(probe.as_ref(), &target, config.timeout, clock.as_ref()).await;

        let delay = config.next_delay();
        next += delay;
        let missed = missed_ticks(next, Instant::now(), delay);
        if missed > 0 {
            warn!(
                "'{}': probe overran its period, skipping {} tick(s)",
                target.name, missed
            );
            counters.add_skipped_ticks(u64::from(missed));
            next = next
                .checked_add(delay.saturating_mul(missed))
                .unwrap_or(Instant::now() + delay);
        }

        if tx.send(sample).await.is_err() {
            debug!("Sample channel closed, stopping cadence for '{}'", target.name);
            break;
        }
    }
    debug!("Cadence for '{}' stopped", target.name);
}
