//! Measurement capabilities.
//!
//! A [`Probe`] performs one measurement against a [`Target`]. [`run`] wraps it
//! with the timeout and timestamping every caller relies on, so a probe
//! failure is always data (a failed [`Sample`]) and never an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::Result;
use crate::window::Clock;

#[cfg(feature = "icmp")]
mod icmp;
mod tcp;
mod throughput;

#[cfg(feature = "icmp")]
pub use icmp::IcmpProbe;
pub use tcp::TcpConnectProbe;
pub use throughput::ThroughputProbe;

/// The measurement technique used for a target
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// ICMP echo round-trip time
    Ping,
    /// TCP handshake time
    Tcp,
    /// HTTP download rate
    Throughput,
    /// HTTP upload rate
    Upload,
}

impl ProbeKind {
    /// The metric this kind of probe reports
    pub fn metric(self) -> Metric {
        match self {
            ProbeKind::Ping => Metric::IcmpRtt,
            ProbeKind::Tcp => Metric::TcpConnect,
            ProbeKind::Throughput => Metric::Download,
            ProbeKind::Upload => Metric::Upload,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Tcp => "tcp",
            ProbeKind::Throughput => "throughput",
            ProbeKind::Upload => "upload",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A measured quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    IcmpRtt,
    TcpConnect,
    Download,
    Upload,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::IcmpRtt => "icmp_rtt_ms",
            Metric::TcpConnect => "tcp_connect_ms",
            Metric::Download => "download_mbps",
            Metric::Upload => "upload_mbps",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one aggregated series: target name plus metric
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub target: Arc<str>,
    pub metric: Metric,
}

impl SeriesKey {
    pub fn new(target: impl Into<Arc<str>>, metric: Metric) -> Self {
        Self {
            target: target.into(),
            metric,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.target, self.metric)
    }
}

/// An endpoint to measure
#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub host: String,
    pub kind: ProbeKind,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub max_bytes: u64,
    pub transfer_time: Duration,
    /// Upper bound of one measurement
    pub timeout: Duration,
}

impl Target {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.name.as_str(), self.kind.metric())
    }
}

/// Why a measurement produced no value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeFailure {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cannot resolve host: {0}")]
    Resolve(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ProbeFailure {
    /// Short label used in logs and documents
    pub fn reason(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout(_) => "timeout",
            ProbeFailure::Resolve(_) => "resolve",
            ProbeFailure::Unreachable(_) => "unreachable",
            ProbeFailure::Protocol(_) => "protocol",
        }
    }
}

/// Result of a single measurement
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(f64),
    Failure(ProbeFailure),
}

/// One raw measurement
#[derive(Debug, Clone)]
pub struct Sample {
    /// When the measurement started
    pub timestamp: DateTime<Utc>,
    pub key: SeriesKey,
    pub outcome: Outcome,
}

impl Sample {
    pub fn success(key: SeriesKey, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            key,
            outcome: Outcome::Success(value),
        }
    }

    pub fn failure(key: SeriesKey, timestamp: DateTime<Utc>, failure: ProbeFailure) -> Self {
        Self {
            timestamp,
            key,
            outcome: Outcome::Failure(failure),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// The measured value, if the measurement succeeded
    pub fn value(&self) -> Option<f64> {
        match self.outcome {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }
}

/// A measurement capability
///
/// Implementations may keep state between calls for the same target, but one
/// instance is only ever driven by one cadence, never concurrently.
#[async_trait]
pub trait Probe: Send + Sync + 'static {
    /// The kind of measurement this probe performs
    fn kind(&self) -> ProbeKind;

    /// Measure once, returning the value in the unit of `kind().metric()`
    async fn measure(&self, target: &Target) -> std::result::Result<f64, ProbeFailure>;
}

/// Run one measurement, bounded by `timeout`, stamped with its start time
pub async fn run(probe: &dyn Probe, target: &Target, timeout: Duration, clock: &dyn Clock) -> Sample {
    let key = target.key();
    let started = clock.now();

    match tokio::time::timeout(timeout, probe.measure(target)).await {
        Ok(Ok(value)) => {
            log::trace!("{}: {:.3}", key, value);
            Sample::success(key, started, value)
        }
        Ok(Err(failure)) => {
            log::debug!("{}: probe failed: {}", key, failure);
            Sample::failure(key, started, failure)
        }
        Err(_) => {
            log::debug!("{}: probe timed out after {:?}", key, timeout);
            Sample::failure(key, started, ProbeFailure::Timeout(timeout))
        }
    }
}

/// Build the probe instance that will serve one target
pub fn probe_for(target: &Target) -> Result<Arc<dyn Probe>> {
    let probe: Arc<dyn Probe> = match target.kind {
        #[cfg(feature = "icmp")]
        ProbeKind::Ping => Arc::new(IcmpProbe::new()),
        #[cfg(not(feature = "icmp"))]
        ProbeKind::Ping => {
            return Err(crate::error::AgentError::Probe(format!(
                "target '{}': built without the icmp feature",
                target.name
            )));
        }
        ProbeKind::Tcp => Arc::new(TcpConnectProbe::new()),
        ProbeKind::Throughput => Arc::new(ThroughputProbe::download()?),
        ProbeKind::Upload => Arc::new(ThroughputProbe::upload()?),
    };
    Ok(probe)
}

/// Resolve a host name (or literal address) to its first IP address
pub(crate) async fn resolve_host(host: &str) -> std::result::Result<std::net::IpAddr, ProbeFailure> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeFailure::Resolve(format!("{}: {}", host, e)))?;
    addrs
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeFailure::Resolve(format!("{}: no addresses found", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::SystemClock;

    struct FixedProbe(std::result::Result<f64, ProbeFailure>);

    #[async_trait]
    impl Probe for FixedProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::Tcp
        }

        async fn measure(&self, _target: &Target) -> std::result::Result<f64, ProbeFailure> {
            self.0.clone()
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::Tcp
        }

        async fn measure(&self, _target: &Target) -> std::result::Result<f64, ProbeFailure> {
            std::future::pending().await
        }
    }

    fn target() -> Target {
        Target {
            name: "edge".to_string(),
            host: "192.0.2.1".to_string(),
            kind: ProbeKind::Tcp,
            port: Some(443),
            url: None,
            max_bytes: 0,
            transfer_time: Duration::ZERO,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_run_success() {
        let sample = run(&FixedProbe(Ok(12.5)), &target(), Duration::from_secs(1), &SystemClock).await;
        assert_eq!(sample.value(), Some(12.5));
        assert_eq!(sample.key, SeriesKey::new("edge", Metric::TcpConnect));
    }

    #[tokio::test]
    async fn test_run_failure_is_a_sample() {
        let failure = ProbeFailure::Unreachable("no route".to_string());
        let sample = run(
            &FixedProbe(Err(failure.clone())),
            &target(),
            Duration::from_secs(1),
            &SystemClock,
        )
        .await;
        assert!(!sample.is_ok());
        assert_eq!(sample.outcome, Outcome::Failure(failure));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_honours_timeout() {
        let timeout = Duration::from_millis(250);
        let sample = run(&HangingProbe, &target(), timeout, &SystemClock).await;
        assert_eq!(sample.outcome, Outcome::Failure(ProbeFailure::Timeout(timeout)));
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let ip = resolve_host("127.0.0.1").await.unwrap();
        assert!(ip.is_loopback());
    }
}
