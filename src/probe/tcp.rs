//! TCP connect latency probe.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::TcpStream;

use super::{Probe, ProbeFailure, ProbeKind, Target, resolve_host};

/// Measures the time to complete a TCP handshake, in milliseconds
#[derive(Debug, Default)]
pub struct TcpConnectProbe;

impl TcpConnectProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Probe for TcpConnectProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Tcp
    }

    async fn measure(&self, target: &Target) -> Result<f64, ProbeFailure> {
        let port = target
            .port
            .ok_or_else(|| ProbeFailure::Protocol("no port configured".to_string()))?;
        let ip = resolve_host(&target.host).await?;
        let addr = SocketAddr::new(ip, port);

        let start = Instant::now();
        let stream = TcpStream::connect(addr).await.map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused => ProbeFailure::Unreachable(format!("{}: refused", addr)),
            _ => ProbeFailure::Unreachable(format!("{}: {}", addr, e)),
        })?;
        let elapsed = start.elapsed();
        drop(stream);

        Ok(elapsed.as_secs_f64() * 1000.0)
    }
}
