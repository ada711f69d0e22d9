//! ICMP echo latency probe.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use surge_ping::{Client, Config, ICMP, PingIdentifier, PingSequence, SurgeError};

use super::{Probe, ProbeFailure, ProbeKind, Target, resolve_host};

/// Payload length of each echo request
const PAYLOAD_LEN: usize = 10;

/// Measures ICMP echo round-trip time, in milliseconds
///
/// The ICMP sockets are opened lazily and reused across runs; the echo
/// sequence number continues from one run to the next so replies can be
/// matched to the request that caused them.
pub struct IcmpProbe {
    identifier: u16,
    sequence: AtomicU16,
    v4: Mutex<Option<Client>>,
    v6: Mutex<Option<Client>>,
}

impl IcmpProbe {
    pub fn new() -> Self {
        Self {
            identifier: rand::random(),
            sequence: AtomicU16::new(0),
            v4: Mutex::new(None),
            v6: Mutex::new(None),
        }
    }

    fn client(&self, ip: IpAddr) -> Result<Client, ProbeFailure> {
        let (slot, config) = match ip {
            IpAddr::V4(_) => (&self.v4, Config::default()),
            IpAddr::V6(_) => (&self.v6, Config::builder().kind(ICMP::V6).build()),
        };

        let mut slot = slot.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = Client::new(&config)
            .map_err(|e| ProbeFailure::Protocol(format!("cannot open ICMP socket: {}", e)))?;
        *slot = Some(client.clone());
        Ok(client)
    }
}

impl Default for IcmpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IcmpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcmpProbe")
            .field("identifier", &self.identifier)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Ping
    }

    async fn measure(&self, target: &Target) -> Result<f64, ProbeFailure> {
        let ip = resolve_host(&target.host).await?;
        let client = self.client(ip)?;

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let payload: [u8; PAYLOAD_LEN] = rand::random();

        let mut pinger = client.pinger(ip, PingIdentifier(self.identifier)).await;
        pinger.timeout(target.timeout);
        match pinger.ping(PingSequence(seq), &payload).await {
            Ok((_, rtt)) => Ok(rtt.as_secs_f64() * 1000.0),
            Err(e) => Err(failure_of(e, ip, target.timeout)),
        }
    }
}

/// Map a ping error onto the failure taxonomy
fn failure_of(err: SurgeError, ip: IpAddr, timeout: Duration) -> ProbeFailure {
    match err {
        SurgeError::Timeout { .. } => ProbeFailure::Timeout(timeout),
        SurgeError::IOError(e) => ProbeFailure::Unreachable(format!("{}: {}", ip, e)),
        SurgeError::NetworkError => ProbeFailure::Unreachable(format!("{}: network error", ip)),
        e => ProbeFailure::Protocol(format!("{}: {}", ip, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

    #[test]
    fn test_missing_reply_is_timeout() {
        let timeout = Duration::from_secs(5);
        let failure = failure_of(SurgeError::Timeout { seq: PingSequence(7) }, IP, timeout);
        assert_eq!(failure, ProbeFailure::Timeout(timeout));
        assert_eq!(failure.reason(), "timeout");
    }

    #[test]
    fn test_socket_errors_are_unreachable() {
        let err = std::io::Error::new(std::io::ErrorKind::HostUnreachable, "no route to host");
        let failure = failure_of(SurgeError::IOError(err), IP, Duration::from_secs(1));
        assert_eq!(failure.reason(), "unreachable");

        let failure = failure_of(SurgeError::NetworkError, IP, Duration::from_secs(1));
        assert_eq!(failure.reason(), "unreachable");
    }

    #[test]
    fn test_unexpected_packets_are_protocol_failures() {
        let failure = failure_of(SurgeError::EchoRequestPacket, IP, Duration::from_secs(1));
        assert!(matches!(failure, ProbeFailure::Protocol(_)));
    }
}
