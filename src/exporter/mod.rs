//! Delivery of window records to the sink.
//!
//! The windower enqueues through an [`ExportHandle`]; a single delivery loop
//! drains the [`DeliveryQueue`] in batches, retrying transient failures with
//! backoff and dropping permanent ones.

use log::{debug, error, info, warn};
use std::future::pending;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{SinkConfig, SinkKind};
use crate::counters::Counters;
use crate::error::Result;
use crate::retry::RetryConfig;
use crate::window::WindowRecord;

mod elastic;
mod queue;
mod sink;

pub use elastic::{ElasticSink, bulk_body, classify_status, document, parse_bulk_response};
pub use queue::{DeliveryQueue, EvictionPolicy, QueueEntry};
pub use sink::{ItemResult, MemorySink, Sink, SinkError};

/// Build the sink described by the configuration
pub fn sink_from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match config.kind {
        SinkKind::Elastic => Arc::new(ElasticSink::new(config)?),
        SinkKind::Memory => Arc::new(MemorySink::new("memory")),
    };
    Ok(sink)
}

/// Producer side of the delivery queue
#[derive(Debug, Clone)]
pub struct ExportHandle {
    queue: Arc<DeliveryQueue>,
    counters: Arc<Counters>,
}

impl ExportHandle {
    pub fn new(queue: Arc<DeliveryQueue>, counters: Arc<Counters>) -> Self {
        Self { queue, counters }
    }

    /// Queue a record for delivery; never waits on the sink
    pub fn enqueue(&self, record: WindowRecord) {
        if let Some(evicted) = self.queue.push(Arc::new(record)) {
            self.counters.inc_dropped_records();
            error!(
                "Delivery queue full ({}), dropped record {} {}",
                self.queue.capacity(),
                evicted.key,
                evicted.window
            );
        }
    }
}

/// The delivery loop and its settings
pub struct Exporter {
    queue: Arc<DeliveryQueue>,
    sink: Arc<dyn Sink>,
    retry: RetryConfig,
    batch_size: usize,
    counters: Arc<Counters>,
}

impl Exporter {
    pub fn new(
        sink: Arc<dyn Sink>,
        queue: Arc<DeliveryQueue>,
        retry: RetryConfig,
        batch_size: usize,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            queue,
            sink,
            retry,
            batch_size: batch_size.max(1),
            counters,
        }
    }

    pub fn handle(&self) -> ExportHandle {
        ExportHandle::new(Arc::clone(&self.queue), Arc::clone(&self.counters))
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    /// Send one batch of entries that are ready at `now`
    ///
    /// Returns the number of entries attempted; zero when none was ready.
    async fn deliver_ready(&self, now: Instant) -> usize {
        let batch = self.queue.take_ready(now, self.batch_size);
        if batch.is_empty() {
            return 0;
        }
        let attempted = batch.len();
        let records: Vec<_> = batch.iter().map(|entry| Arc::clone(&entry.record)).collect();

        let results = match self.sink.deliver(&records).await {
            Ok(results) if results.len() == attempted => results,
            Ok(results) => {
                warn!(
                    "Sink {} returned {} results for {} records",
                    self.sink.name(),
                    results.len(),
                    attempted
                );
                vec![Err(SinkError::Transient("incomplete sink response".to_string())); attempted]
            }
            Err(e) => vec![Err(e); attempted],
        };

        let mut finished = 0;
        let mut retries = Vec::new();
        for (mut entry, result) in batch.into_iter().zip(results) {
            entry.attempts += 1;
            match result {
                Ok(()) => {
                    finished += 1;
                    self.counters.inc_delivered_records();
                }
                Err(SinkError::Permanent(reason)) => {
                    finished += 1;
                    self.counters.inc_rejected_records();
                    error!(
                        "Sink rejected {} {}: {}",
                        entry.record.key, entry.record.window, reason
                    );
                }
                Err(SinkError::Transient(reason)) if self.retry.can_retry(entry.attempts) => {
                    let backoff = self.retry.backoff(entry.attempts);
                    warn!(
                        "Delivery of {} {} failed (attempt {}/{}): {}; retrying in {:?}",
                        entry.record.key,
                        entry.record.window,
                        entry.attempts,
                        self.retry.max_attempts,
                        reason,
                        backoff
                    );
                    entry.ready_at = Instant::now() + backoff;
                    self.counters.inc_delivery_retries();
                    retries.push(entry);
                }
                Err(SinkError::Transient(reason)) => {
                    finished += 1;
                    self.counters.inc_failed_records();
                    error!(
                        "Giving up on {} {} after {} attempts: {}",
                        entry.record.key, entry.record.window, entry.attempts, reason
                    );
                }
            }
        }

        debug!(
            "Delivered batch of {}: {} finished, {} to retry",
            attempted,
            finished,
            retries.len()
        );
        self.queue.complete(finished);
        self.queue.requeue(retries);
        attempted
    }

    /// Deliver records as they arrive until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!("Delivery loop started for sink {}", self.sink.name());
        while !cancel.is_cancelled() {
            if self.deliver_ready(Instant::now()).await > 0 {
                continue;
            }

            let next_retry = self.queue.next_ready_at();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = async {
                    match next_retry {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => pending().await,
                    }
                } => {}
            }
        }
        debug!("Delivery loop stopped");
    }

    /// Keep delivering until the queue is empty or `deadline` passes
    ///
    /// Retries due after the deadline are not waited for. Returns the number
    /// of records left undelivered.
    pub async fn flush(&self, deadline: Instant) -> usize {
        let pending_at_start = self.queue.pending();
        loop {
            let now = Instant::now();
            if now >= deadline || self.queue.pending() == 0 {
                break;
            }
            match tokio::time::timeout_at(deadline, self.deliver_ready(now)).await {
                Ok(0) => match self.queue.next_ready_at() {
                    Some(at) if at < deadline => tokio::time::sleep_until(at).await,
                    _ => break,
                },
                Ok(_) => {}
                Err(_) => {
                    warn!("Delivery still in progress at the shutdown deadline");
                    break;
                }
            }
        }

        let undelivered = self.queue.pending();
        info!(
            "Flushed delivery queue: {} of {} record(s) left undelivered",
            undelivered, pending_at_start
        );
        undelivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Metric, ProbeKind, SeriesKey};
    use crate::retry::RetryBuilder;
    use crate::window::WindowSpec;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Answers each call with the next scripted status, then with the last one
    struct ScriptedSink {
        script: Mutex<VecDeque<u16>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedSink {
        fn new(statuses: &[u16]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(statuses.iter().copied().collect()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn deliver(&self, records: &[Arc<WindowRecord>]) -> std::result::Result<Vec<ItemResult>, SinkError> {
            self.calls.lock().push(Instant::now());
            let status = {
                let mut script = self.script.lock();
                if script.len() > 1 {
                    script.pop_front().unwrap_or(200)
                } else {
                    script.front().copied().unwrap_or(200)
                }
            };
            classify_status(status, "scripted")?;
            Ok(vec![Ok(()); records.len()])
        }
    }

    fn record(n: i64) -> WindowRecord {
        let spec = WindowSpec::new(Duration::from_secs(3)).unwrap();
        let start = Utc.timestamp_opt(1_700_000_001, 0).unwrap() + TimeDelta::seconds(3 * n);
        WindowRecord::aggregate(
            SeriesKey::new("edge", Metric::IcmpRtt),
            "192.0.2.1".into(),
            ProbeKind::Ping,
            spec.window_of(start),
            &[],
            &[],
        )
    }

    fn exporter(sink: Arc<dyn Sink>, max_attempts: u32, capacity: usize) -> (Arc<Exporter>, Arc<Counters>) {
        let counters = Arc::new(Counters::new());
        let retry = RetryBuilder::new()
            .max_attempts(max_attempts)
            .initial_backoff(Duration::from_millis(200))
            .backoff_factor(2.0)
            .max_backoff(Duration::from_secs(30))
            .jitter(0.5)
            .build();
        let queue = Arc::new(DeliveryQueue::new(capacity, EvictionPolicy::DropOldest));
        let exporter = Exporter::new(sink, queue, retry, 10, Arc::clone(&counters));
        (Arc::new(exporter), counters)
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_unavailable_then_success() {
        let sink = ScriptedSink::new(&[503, 503, 200]);
        let (exporter, counters) = exporter(sink.clone(), 5, 16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&exporter).run(cancel.clone()));

        exporter.handle().enqueue(record(0));
        wait_for(|| counters.delivered_records() == 1).await;

        let calls = sink.calls();
        assert_eq!(calls.len(), 3);
        let first_wait = calls[1] - calls[0];
        let second_wait = calls[2] - calls[1];
        assert!(first_wait >= Duration::from_millis(200), "{:?}", first_wait);
        assert!(second_wait > first_wait, "{:?} then {:?}", first_wait, second_wait);
        assert_eq!(counters.delivery_retries(), 2);
        assert_eq!(counters.failed_records(), 0);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(exporter.queue().pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_never_exceed_max() {
        let sink = ScriptedSink::new(&[503]);
        let (exporter, counters) = exporter(sink.clone(), 3, 16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&exporter).run(cancel.clone()));

        exporter.handle().enqueue(record(0));
        wait_for(|| counters.failed_records() == 1).await;
        // Give a stray extra attempt the chance to show up
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(sink.calls().len(), 3);
        assert_eq!(counters.delivery_retries(), 2);
        assert_eq!(counters.delivered_records(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let sink = ScriptedSink::new(&[400]);
        let (exporter, counters) = exporter(sink.clone(), 5, 16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&exporter).run(cancel.clone()));

        exporter.handle().enqueue(record(0));
        wait_for(|| counters.rejected_records() == 1).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(sink.calls().len(), 1);
        assert_eq!(counters.delivery_retries(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_counts_evictions() {
        let sink = ScriptedSink::new(&[200]);
        let (exporter, counters) = exporter(sink, 5, 10);
        let handle = exporter.handle();
        for n in 0..15 {
            handle.enqueue(record(n));
        }
        assert_eq!(counters.dropped_records(), 5);
        assert_eq!(exporter.queue().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_everything_in_batches() {
        let sink = Arc::new(MemorySink::new("memory"));
        let (exporter, counters) = exporter(sink.clone(), 5, 64);
        for n in 0..25 {
            exporter.handle().enqueue(record(n));
        }

        let undelivered = exporter.flush(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(undelivered, 0);
        assert_eq!(sink.len(), 25);
        assert_eq!(counters.delivered_records(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_reports_undelivered_at_deadline() {
        let sink = ScriptedSink::new(&[503]);
        let (exporter, counters) = exporter(sink.clone(), 100, 16);
        exporter.handle().enqueue(record(0));
        exporter.handle().enqueue(record(1));

        let undelivered = exporter.flush(Instant::now() + Duration::from_secs(2)).await;
        assert_eq!(undelivered, 2);
        assert!(sink.calls().len() >= 2);
        assert_eq!(counters.delivered_records(), 0);
    }
}
