use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::Window;
use crate::probe::{Outcome, ProbeKind, Sample, SeriesKey};

/// Summary statistics over the successful samples of one window
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Sample standard deviation, present with two or more values
    pub stddev: Option<f64>,
    /// `(percentile, value)` pairs in configured order
    pub percentiles: Vec<(f64, f64)>,
}

impl Summary {
    /// Summarise already sorted values; `None` when there are none
    fn from_sorted(values: &[f64], percentiles: &[f64]) -> Option<Self> {
        let (&min, &max) = (values.first()?, values.last()?);
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let stddev = (values.len() >= 2).then(|| {
            let sq: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
            (sq / (n - 1.0)).sqrt()
        });
        let percentiles = percentiles
            .iter()
            .filter_map(|&p| percentile(values, p).map(|v| (p, v)))
            .collect();

        Some(Self {
            min,
            max,
            mean,
            stddev,
            percentiles,
        })
    }
}

/// Percentile `p` (0-100) of sorted `values`, interpolating between neighbours
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let rank = (p / 100.0).clamp(0.0, 1.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let frac = rank - lower as f64;

    let mut value = (1.0 - frac) * values[lower];
    if frac > 0.0 {
        value += frac * values[lower + 1];
    }
    Some(value)
}

/// The aggregate emitted for one (target, metric, window)
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRecord {
    /// Stable identity of this (series, window), reused on every delivery attempt
    pub id: Uuid,
    pub key: SeriesKey,
    pub host: Arc<str>,
    pub probe: ProbeKind,
    pub window: Window,
    /// Successful samples
    pub count: u64,
    /// Failed samples
    pub failures: u64,
    /// Failure counts keyed by reason
    pub failure_reasons: BTreeMap<&'static str, u64>,
    pub summary: Option<Summary>,
    /// The window was not observed for its whole length
    pub partial: bool,
}

impl WindowRecord {
    /// Aggregate the samples drained from one window
    pub fn aggregate(
        key: SeriesKey,
        host: Arc<str>,
        probe: ProbeKind,
        window: Window,
        samples: &[Sample],
        percentiles: &[f64],
    ) -> Self {
        let mut values = Vec::with_capacity(samples.len());
        let mut failure_reasons = BTreeMap::new();
        let mut failures = 0;

        for sample in samples {
            debug_assert!(window.contains(sample.timestamp));
            match &sample.outcome {
                Outcome::Success(value) => values.push(*value),
                Outcome::Failure(failure) => {
                    failures += 1;
                    *failure_reasons.entry(failure.reason()).or_insert(0) += 1;
                }
            }
        }
        values.sort_by(f64::total_cmp);

        Self {
            id: record_id(&key, &window),
            count: values.len() as u64,
            failures,
            failure_reasons,
            summary: Summary::from_sorted(&values, percentiles),
            key,
            host,
            probe,
            window,
            partial: false,
        }
    }

    /// Mark this record as covering only part of its window
    pub fn with_partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Fraction of failed measurements, if any were made
    pub fn loss(&self) -> Option<f64> {
        let total = self.count + self.failures;
        (total > 0).then(|| self.failures as f64 / total as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.failures == 0
    }
}

fn record_id(key: &SeriesKey, window: &Window) -> Uuid {
    let name = format!(
        "netprobe://{}/{}/{}",
        key.target,
        key.metric,
        window.start.timestamp_millis()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}
