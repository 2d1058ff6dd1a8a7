//! Connect-latency probing of configured ping targets.
//!
//! Probes measure TCP connect round-trip time instead of raw ICMP, so they
//! run unprivileged. One probe per target per collection round; packet loss
//! is therefore 0 or 100 for a single round and smooths out in the rollups.

use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::metrics::{PingResult, PingStatus};
use crate::registry::PingTarget;

/// Default probe timeout; a probe past it reports `timeout`.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Port used when a target names a bare host or address.
const DEFAULT_PORT: u16 = 80;

fn resolve(host: &str) -> Option<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, DEFAULT_PORT));
    }
    let with_port = if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_PORT)
    };
    with_port.to_socket_addrs().ok()?.next()
}

/// Probes one target. Never blocks longer than `timeout` plus resolution.
pub fn probe_target(target: &PingTarget, timeout: Duration) -> PingResult {
    let base = PingResult {
        name: target.name.clone(),
        host: target.host.clone(),
        latency_ms: None,
        packet_loss: 100.0,
        status: PingStatus::Error,
    };
    let Some(addr) = resolve(&target.host) else {
        return base;
    };

    let start = Instant::now();
    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => PingResult {
            latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            packet_loss: 0.0,
            status: PingStatus::Ok,
            ..base
        },
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => PingResult {
            status: PingStatus::Timeout,
            ..base
        },
        Err(_) => base,
    }
}

/// One probe round over all configured targets.
pub fn run_probes(targets: &[PingTarget], timeout: Duration) -> Vec<PingResult> {
    targets
        .iter()
        .map(|t| probe_target(t, timeout))
        .collect()
}
