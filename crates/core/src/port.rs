//! Free-port discovery with a probe → listen → commit handshake.
//!
//! A [`PortBinder`] probes candidate ports by binding (and immediately
//! dropping) a listener on every requested host. The returned
//! [`PortReservation`] keeps the binder locked until the caller has bound its
//! own listener and calls [`PortReservation::commit`], so a second reservation
//! in the same process cannot be handed the same still-unbound port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::Range;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::BindError;

pub const DEFAULT_PORT_RANGE: Range<u16> = 3000..3100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub desired: Option<u16>,
    pub range: Range<u16>,
    pub hosts: Vec<IpAddr>,
}

impl PortRequest {
    pub fn new(desired: Option<u16>, range: Range<u16>) -> Self {
        Self {
            desired,
            range,
            hosts: candidate_hosts(),
        }
    }
}

/// Result of a single bind probe, after OS errors have been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Free,
    InUse,
    /// The host address itself cannot be bound here; it does not constrain
    /// the port.
    HostUnavailable,
}

/// Serializes reservations made through clones of the same binder.
#[derive(Debug, Clone, Default)]
pub struct PortBinder {
    lock: Arc<Mutex<()>>,
}

#[must_use = "dropping a reservation without committing releases the port to other reservers"]
pub struct PortReservation {
    port: u16,
    _guard: OwnedMutexGuard<()>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Called once the caller's own listener is bound on the port.
    pub fn commit(self) {
        debug!(port = self.port, "Port reservation committed");
    }
}

impl std::fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortReservation")
            .field("port", &self.port)
            .finish()
    }
}

impl PortBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reserve(&self, request: &PortRequest) -> Result<PortReservation, BindError> {
        let guard = self.lock.clone().lock_owned().await;

        if let Some(desired) = request.desired {
            if probe_all(desired, &request.hosts).await? == ProbeOutcome::Free {
                return Ok(PortReservation {
                    port: desired,
                    _guard: guard,
                });
            }
            info!(
                port = desired,
                "Desired port is unavailable; scanning the fallback range"
            );
        }

        for port in request.range.clone() {
            if Some(port) == request.desired {
                continue;
            }
            if probe_all(port, &request.hosts).await? == ProbeOutcome::Free {
                return Ok(PortReservation {
                    port,
                    _guard: guard,
                });
            }
        }

        Err(BindError::NoFreePort {
            from: request.range.start,
            to: request.range.end,
        })
    }
}

/// `Free` only when at least one host accepted the bind and none reported
/// the port in use.
async fn probe_all(port: u16, hosts: &[IpAddr]) -> Result<ProbeOutcome, BindError> {
    let mut bound_any = false;
    for host in hosts {
        let outcome = probe(*host, port)
            .await
            .map_err(|source| BindError::Io {
                host: *host,
                port,
                source,
            })?;
        match outcome {
            ProbeOutcome::InUse => {
                debug!(%host, port, "Port is in use");
                return Ok(ProbeOutcome::InUse);
            }
            ProbeOutcome::HostUnavailable => {
                debug!(%host, port, "Host address not available; skipping");
            }
            ProbeOutcome::Free => bound_any = true,
        }
    }
    if bound_any {
        Ok(ProbeOutcome::Free)
    } else {
        Ok(ProbeOutcome::HostUnavailable)
    }
}

async fn probe(host: IpAddr, port: u16) -> io::Result<ProbeOutcome> {
    match TcpListener::bind(SocketAddr::new(host, port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(ProbeOutcome::Free)
        }
        Err(err) => classify_probe_error(err),
    }
}

/// Address-in-use means "try the next port"; everything else is fatal.
pub fn classify_probe_error(err: io::Error) -> io::Result<ProbeOutcome> {
    if is_addr_in_use(&err) {
        Ok(ProbeOutcome::InUse)
    } else if err.kind() == io::ErrorKind::AddrNotAvailable {
        Ok(ProbeOutcome::HostUnavailable)
    } else {
        Err(err)
    }
}

pub fn is_addr_in_use(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::AddrInUse
}

pub fn is_ipv6_supported() -> bool {
    std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_ok()
}

/// Hosts a port must be bindable on: wildcard plus loopback.
pub fn candidate_hosts() -> Vec<IpAddr> {
    if is_ipv6_supported() {
        vec![
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ]
    } else {
        vec![
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        ]
    }
}

pub fn listen_host() -> IpAddr {
    if is_ipv6_supported() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}
