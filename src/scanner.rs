//! Local-network broker discovery.
//!
//! Sweeps the local /24 with short TCP connect probes on the broker port.
//! Anything that accepts the connection is offered as a candidate; actually
//! speaking MQTT to it is left to the connection manager once the user picks
//! one. The subnet is derived from the local interface address, falling back
//! to 192.168.1.0/24 when that cannot be determined.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("could not determine a local address: {0}")]
    LocalAddr(String),

    #[error("scan was aborted")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub port: u16,
    pub probe_timeout_ms: u64,
    pub parallelism: usize,
    /// First three octets of the subnet to sweep, e.g. "192.168.1". Derived
    /// from the local address when unset.
    pub subnet: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: 1883,
            probe_timeout_ms: 300,
            parallelism: 50,
            subnet: None,
        }
    }
}

/// Sweeps the configured subnet and returns every host that accepted a TCP
/// connection on the broker port.
pub async fn scan(config: &ScanConfig) -> Result<Vec<SocketAddr>, ScanError> {
    let (base, local) = match &config.subnet {
        Some(base) => (base.clone(), None),
        None => derive_subnet()?,
    };

    let candidates: Vec<IpAddr> = (1u8..255)
        .filter_map(|host| format!("{base}.{host}").parse().ok())
        .filter(|ip| Some(*ip) != local)
        .collect();
    if candidates.is_empty() {
        return Err(ScanError::LocalAddr(format!("unusable subnet base {base}")));
    }

    info!(
        "scanning {}.0/24 on port {} ({} hosts)",
        base,
        config.port,
        candidates.len()
    );
    let found = probe_candidates(&candidates, config).await?;
    info!("scan finished, {} broker candidates", found.len());
    Ok(found)
}

/// Probes each candidate with a bounded number of in-flight connections.
pub async fn probe_candidates(
    candidates: &[IpAddr],
    config: &ScanConfig,
) -> Result<Vec<SocketAddr>, ScanError> {
    let limit = Arc::new(Semaphore::new(config.parallelism.max(1)));
    let probe_timeout = Duration::from_millis(config.probe_timeout_ms.max(1));

    let mut probes = Vec::with_capacity(candidates.len());
    for ip in candidates {
        let addr = SocketAddr::new(*ip, config.port);
        let permit = limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScanError::Aborted)?;
        probes.push(tokio::spawn(async move {
            let _permit = permit;
            match timeout(probe_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => {
                    debug!("open broker port at {}", addr);
                    Some(addr)
                }
                _ => None,
            }
        }));
    }

    let mut found = Vec::new();
    for probe in probes {
        if let Ok(Some(addr)) = probe.await {
            found.push(addr);
        }
    }
    found.sort();
    Ok(found)
}

/// Derives the first three octets of the local /24 by opening an outbound
/// UDP socket (no packets are sent). Falls back to 192.168.1 when the local
/// address cannot be read.
fn derive_subnet() -> Result<(String, Option<IpAddr>), ScanError> {
    let local = local_ipv4();
    match local {
        Some(ip) => {
            let octets = ip.octets();
            Ok((
                format!("{}.{}.{}", octets[0], octets[1], octets[2]),
                Some(IpAddr::V4(ip)),
            ))
        }
        None => {
            warn!("could not determine local address, falling back to 192.168.1.0/24");
            Ok(("192.168.1".to_string(), None))
        }
    }
}

fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) => Some(*addr.ip()),
        SocketAddr::V6(_) => None,
    }
}
