use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, trace};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Clock, WindowRecord, WindowSpec};
use crate::buffer::{DrainedWindow, SampleBuffer, SeriesBuffers};
use crate::config::WindowConfig;
use crate::counters::Counters;
use crate::error::{AgentError, Result};
use crate::exporter::ExportHandle;

/// Settings of the window clock
#[derive(Debug, Clone)]
pub struct WindowerConfig {
    pub spec: WindowSpec,
    /// Delay after a window ends before it is closed
    pub grace: Duration,
    /// Skip records for windows without any sample
    pub suppress_empty: bool,
    pub percentiles: Vec<f64>,
}

impl WindowerConfig {
    pub fn from_config(config: &WindowConfig) -> Result<Self> {
        Ok(Self {
            spec: WindowSpec::new(config.duration)?,
            grace: config.grace,
            suppress_empty: config.suppress_empty,
            percentiles: config.percentiles.clone(),
        })
    }

    fn grace_delta(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.grace).map_err(|_| AgentError::config("window grace out of range"))
    }
}

/// Closes windows on the global grid and hands their aggregates to the exporter
pub struct Windower {
    config: WindowerConfig,
    grace: TimeDelta,
    buffers: Arc<SeriesBuffers>,
    export: ExportHandle,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
    /// Windows starting before this instant were not fully observed
    started_at: DateTime<Utc>,
}

impl Windower {
    pub fn new(
        config: WindowerConfig,
        buffers: Arc<SeriesBuffers>,
        export: ExportHandle,
        counters: Arc<Counters>,
        clock: Arc<dyn Clock>,
        started_at: DateTime<Utc>,
    ) -> Result<Self> {
        let grace = config.grace_delta()?;
        Ok(Self {
            config,
            grace,
            buffers,
            export,
            counters,
            clock,
            started_at,
        })
    }

    pub fn spec(&self) -> WindowSpec {
        self.config.spec
    }

    /// Close every window whose end plus grace is at or before `now`
    ///
    /// Returns the number of records handed to the exporter.
    pub fn close_due(&self, now: DateTime<Utc>) -> usize {
        let boundary = self.config.spec.start_of(now - self.grace);
        self.buffers
            .iter()
            .map(|buffer| {
                let drained = buffer.close_until(boundary);
                self.emit(buffer, drained, None)
            })
            .sum()
    }

    /// Close every open window regardless of time, marking incomplete ones partial
    pub fn flush_all(&self, now: DateTime<Utc>) -> usize {
        let emitted = self
            .buffers
            .iter()
            .map(|buffer| {
                let drained = buffer.close_all(now);
                self.emit(buffer, drained, Some(now))
            })
            .sum();
        info!("Flushed {} window record(s) at shutdown", emitted);
        emitted
    }

    fn emit(&self, buffer: &SampleBuffer, drained: Vec<DrainedWindow>, flushed_at: Option<DateTime<Utc>>) -> usize {
        let mut emitted = 0;
        for DrainedWindow { window, samples } in drained {
            if samples.is_empty() && self.config.suppress_empty {
                trace!("{}: suppressing empty window {}", buffer.key(), window);
                continue;
            }

            let partial = window.start < self.started_at
                || flushed_at.is_some_and(|now| window.end > now);
            let record = WindowRecord::aggregate(
                buffer.key().clone(),
                Arc::clone(buffer.host()),
                buffer.probe(),
                window,
                &samples,
                &self.config.percentiles,
            )
            .with_partial(partial);

            debug!(
                "{} {}: count={} failures={}{}",
                record.key,
                record.window,
                record.count,
                record.failures,
                if partial { " (partial)" } else { "" }
            );
            self.counters.inc_windows_emitted();
            self.export.enqueue(record);
            emitted += 1;
        }
        emitted
    }

    /// How long to wait, from `now`, until the next window becomes due
    fn until_next_close(&self, now: DateTime<Utc>) -> Duration {
        let spec = self.config.spec;
        let due_at = spec.start_of(now - self.grace) + spec.duration() + self.grace;
        (due_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Close windows as they become due until cancelled
    ///
    /// Cancellation does not flush; the coordinator calls [`Windower::flush_all`]
    /// once the producers have stopped.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!(
            "Windower started: {:?} windows, {:?} grace, {} series",
            self.config.spec.duration().to_std().unwrap_or_default(),
            self.config.grace,
            self.buffers.len()
        );
        loop {
            let wait = self.until_next_close(self.clock.now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {
                    self.close_due(self.clock.now());
                }
            }
        }
        debug!("Windower stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{DeliveryQueue, EvictionPolicy};
    use crate::probe::{Metric, ProbeKind, Sample, SeriesKey};
    use crate::window::SystemClock;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_001, 0).unwrap()
    }

    fn ms(offset: i64) -> DateTime<Utc> {
        t0() + TimeDelta::milliseconds(offset)
    }

    fn key() -> SeriesKey {
        SeriesKey::new("edge", Metric::TcpConnect)
    }

    struct Fixture {
        windower: Windower,
        buffers: Arc<SeriesBuffers>,
        queue: Arc<DeliveryQueue>,
        counters: Arc<Counters>,
    }

    fn fixture(started_at: DateTime<Utc>, suppress_empty: bool) -> Fixture {
        let config = WindowerConfig {
            spec: WindowSpec::new(Duration::from_secs(3)).unwrap(),
            grace: Duration::from_millis(500),
            suppress_empty,
            percentiles: vec![50.0],
        };
        let counters = Arc::new(Counters::new());
        let buffer = SampleBuffer::new(
            key(),
            "192.0.2.7",
            ProbeKind::Tcp,
            config.spec,
            started_at,
            Arc::clone(&counters),
        );
        let buffers = Arc::new(SeriesBuffers::new([buffer], Arc::clone(&counters)));
        let queue = Arc::new(DeliveryQueue::new(64, EvictionPolicy::DropOldest));
        let export = ExportHandle::new(Arc::clone(&queue), Arc::clone(&counters));
        let windower = Windower::new(
            config,
            Arc::clone(&buffers),
            export,
            Arc::clone(&counters),
            Arc::new(SystemClock),
            started_at,
        )
        .unwrap();
        Fixture {
            windower,
            buffers,
            queue,
            counters,
        }
    }

    fn queued(queue: &DeliveryQueue) -> Vec<Arc<WindowRecord>> {
        queue
            .take_ready(tokio::time::Instant::now(), usize::MAX)
            .into_iter()
            .map(|entry| entry.record)
            .collect()
    }

    #[tokio::test]
    async fn test_window_waits_for_grace() {
        let f = fixture(t0(), false);
        f.buffers.route(Sample::success(key(), ms(100), 4.0));

        assert_eq!(f.windower.close_due(ms(3_400)), 0);
        assert_eq!(f.windower.close_due(ms(3_500)), 1);

        let records = queued(&f.queue);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 1);
        assert!(!records[0].partial);
        assert_eq!(f.counters.windows_emitted(), 1);
    }

    #[tokio::test]
    async fn test_sample_inside_grace_counts_for_its_window() {
        let f = fixture(t0(), false);
        // Measurement started before the boundary, finished after it
        f.buffers.route(Sample::success(key(), ms(2_990), 9.0));
        assert_eq!(f.windower.close_due(ms(3_200)), 0);
        assert_eq!(f.windower.close_due(ms(3_600)), 1);

        let records = queued(&f.queue);
        assert_eq!(records[0].window.start, t0());
        assert_eq!(records[0].count, 1);
    }

    #[tokio::test]
    async fn test_first_window_is_partial_when_started_mid_window() {
        let f = fixture(ms(1_200), false);
        f.buffers.route(Sample::success(key(), ms(1_500), 4.0));
        f.buffers.route(Sample::success(key(), ms(3_500), 4.0));

        assert_eq!(f.windower.close_due(ms(6_500)), 2);
        let records = queued(&f.queue);
        assert!(records[0].partial);
        assert!(!records[1].partial);
    }

    #[tokio::test]
    async fn test_empty_windows_emitted_unless_suppressed() {
        let f = fixture(t0(), false);
        assert_eq!(f.windower.close_due(ms(9_500)), 3);
        assert!(queued(&f.queue).iter().all(|r| r.is_empty()));

        let f = fixture(t0(), true);
        f.buffers.route(Sample::success(key(), ms(3_100), 1.0));
        assert_eq!(f.windower.close_due(ms(9_500)), 1);
        assert_eq!(queued(&f.queue)[0].window.start, ms(3_000));
    }

    #[tokio::test]
    async fn test_flush_marks_open_window_partial() {
        let f = fixture(t0(), false);
        f.buffers.route(Sample::success(key(), ms(100), 1.0));
        f.buffers.route(Sample::success(key(), ms(3_100), 2.0));

        assert_eq!(f.windower.flush_all(ms(3_200)), 2);
        let records = queued(&f.queue);
        assert!(!records[0].partial);
        assert!(records[1].partial);

        // Nothing is emitted twice
        assert_eq!(f.windower.flush_all(ms(3_300)), 0);
    }

    #[test]
    fn test_until_next_close() {
        let f = fixture(t0(), false);
        assert_eq!(f.windower.until_next_close(ms(0)), Duration::from_millis(500));
        assert_eq!(f.windower.until_next_close(ms(400)), Duration::from_millis(100));
        assert_eq!(f.windower.until_next_close(ms(500)), Duration::from_millis(3_000));
        assert_eq!(f.windower.until_next_close(ms(2_000)), Duration::from_millis(1_500));
    }
}
