//! HTTP throughput probes.

use async_trait::async_trait;
use rand::Rng;
use std::time::{Duration, Instant};

use super::{Probe, ProbeFailure, ProbeKind, Target};
use crate::error::Result;

/// Transfers shorter than this are too noisy to report a rate for
const MIN_TRANSFER_SECS: f64 = 0.01;

/// Largest body sent in one upload request
const UPLOAD_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Download,
    Upload,
}

/// Measures HTTP transfer rate in megabits per second
///
/// Downloads stream a GET response; uploads POST generated bodies of at most
/// [`UPLOAD_CHUNK`] bytes until the byte or time cap is reached. The HTTP
/// client (and its connection pool) is kept for the lifetime of the probe, so
/// repeated runs against one target reuse the connection.
#[derive(Debug, Clone)]
pub struct ThroughputProbe {
    client: reqwest::Client,
    direction: Direction,
}

impl ThroughputProbe {
    pub fn download() -> Result<Self> {
        Self::build(Direction::Download)
    }

    pub fn upload() -> Result<Self> {
        Self::build(Direction::Upload)
    }

    fn build(direction: Direction) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("netprobe/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, direction })
    }

    async fn download_from(
        &self,
        url: &str,
        max_bytes: u64,
        transfer_time: Duration,
    ) -> std::result::Result<Transfer, ProbeFailure> {
        let mut response = self.client.get(url).send().await.map_err(request_failure)?;
        check_status(&response, url)?;

        let start = Instant::now();
        let mut bytes: u64 = 0;
        while bytes < max_bytes && start.elapsed() < transfer_time {
            match response.chunk().await {
                Ok(Some(chunk)) => bytes += chunk.len() as u64,
                Ok(None) => break,
                Err(e) => return Err(ProbeFailure::Protocol(format!("transfer aborted: {}", e))),
            }
        }
        Ok(Transfer {
            bytes,
            elapsed: start.elapsed(),
        })
    }

    async fn upload_to(
        &self,
        url: &str,
        max_bytes: u64,
        transfer_time: Duration,
    ) -> std::result::Result<Transfer, ProbeFailure> {
        let chunk_len = usize::try_from(max_bytes).unwrap_or(usize::MAX).min(UPLOAD_CHUNK);
        let mut payload = vec![0u8; chunk_len];
        rand::rng().fill(&mut payload[..]);

        let start = Instant::now();
        let mut bytes: u64 = 0;
        while bytes < max_bytes && start.elapsed() < transfer_time {
            let len = (max_bytes - bytes).min(chunk_len as u64) as usize;
            let response = self
                .client
                .post(url)
                .body(payload[..len].to_vec())
                .send()
                .await
                .map_err(request_failure)?;
            check_status(&response, url)?;
            // Read the reply so the connection returns to the pool
            let _ = response.bytes().await;
            bytes += len as u64;
        }
        Ok(Transfer {
            bytes,
            elapsed: start.elapsed(),
        })
    }
}

/// Bytes moved and the time it took
#[derive(Debug, Clone, Copy)]
struct Transfer {
    bytes: u64,
    elapsed: Duration,
}

impl Transfer {
    fn rate(&self) -> std::result::Result<f64, ProbeFailure> {
        rate_mbps(self.bytes, self.elapsed.as_secs_f64()).ok_or_else(|| {
            ProbeFailure::Protocol(format!("transfer too short to measure ({} bytes)", self.bytes))
        })
    }
}

/// Megabits per second for `bytes` transferred in `secs`
fn rate_mbps(bytes: u64, secs: f64) -> Option<f64> {
    if secs < MIN_TRANSFER_SECS {
        return None;
    }
    Some(bytes as f64 * 8.0 / secs / 1_000_000.0)
}

fn request_failure(e: reqwest::Error) -> ProbeFailure {
    if e.is_connect() {
        ProbeFailure::Unreachable(e.to_string())
    } else {
        ProbeFailure::Protocol(e.to_string())
    }
}

fn check_status(response: &reqwest::Response, url: &str) -> std::result::Result<(), ProbeFailure> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(ProbeFailure::Protocol(format!(
        "HTTP {} from {}",
        response.status(),
        url
    )))
}

#[async_trait]
impl Probe for ThroughputProbe {
    fn kind(&self) -> ProbeKind {
        match self.direction {
            Direction::Download => ProbeKind::Throughput,
            Direction::Upload => ProbeKind::Upload,
        }
    }

    async fn measure(&self, target: &Target) -> std::result::Result<f64, ProbeFailure> {
        let url = target
            .url
            .as_deref()
            .ok_or_else(|| ProbeFailure::Protocol("no URL configured".to_string()))?;

        let transfer = match self.direction {
            Direction::Download => {
                self.download_from(url, target.max_bytes, target.transfer_time)
                    .await?
            }
            Direction::Upload => {
                self.upload_to(url, target.max_bytes, target.transfer_time)
                    .await?
            }
        };
        transfer.rate()
    }
}
