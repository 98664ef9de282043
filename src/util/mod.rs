use anyhow::{bail, Result};
use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, SocketAddr};
use str0m::{net::Protocol, Candidate};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Whether an address is worth advertising to a remote ICE peer.
pub fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_broadcast(),
        IpAddr::V6(_) => false,
    }
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Returns the first interface address that is not loopback, link-local or
/// broadcast.
pub fn select_host_address() -> Result<IpAddr> {
    for (name, ip) in list_afinet_netifas()? {
        if is_routable(ip) {
            info!("iface: {} / {:?}", name, ip);
            return Ok(ip);
        }
    }

    bail!("Found no usable network interface")
}

/// Host candidates for the bound socket address plus any `extra` addresses
/// that forward to it (e.g. a port-forwarded public address).
pub fn host_candidates(local: SocketAddr, extra: &[IpAddr]) -> Vec<Candidate> {
    let mut addrs = vec![local];
    for ip in extra {
        let addr = SocketAddr::new(*ip, local.port());
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    addrs
        .into_iter()
        .filter_map(|addr| match Candidate::host(addr, Protocol::Udp) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                warn!("Skipping host candidate {}: {}", addr, e);
                None
            }
        })
        .collect()
}
