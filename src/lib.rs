//! # veiltun
//!
//! A point-to-multipoint layer-3 VPN data plane. A server terminates the
//! virtual interface `myvpn0` and bridges it with many remote peers over
//! UDP; each client terminates its own `myvpn0` and tunnels all host
//! traffic to the server. An optional SOCKS5 UDP-Associate hop (provided by
//! an external obfuscation relay) can be interposed between client and
//! server to disguise the UDP stream.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Forwarding Engines (client pump / server fan-out)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  UDP Transport (framing, sequencing, keep-alive,        │
//! │                 SOCKS5 envelope, per-peer anti-replay)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Record Layer (LZ4 gate + ChaCha20-Poly1305,            │
//! │                6-byte header doubles as AAD)            │
//! ├─────────────────────────────────────────────────────────┤
//! │  Host Plumbing (TUN device, routes, forwarding + NAT)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Authenticated framing**: every DATA record is sealed with its own
//!    header as associated data, so headers cannot be rewritten in flight
//! 2. **Replay resistance**: a per-peer sliding window rejects duplicated
//!    and very-late datagrams
//! 3. **Reversibility**: every host mutation (routes, forwarding flag,
//!    firewall rules) is recorded and undone on shutdown
//! 4. **No reliability machinery**: datagrams are fire-and-forget; overload
//!    is shed by the kernel, never queued in user space

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

pub mod bufpool;
pub mod client;
pub mod compress;
pub mod crypto;
pub mod error;
pub mod replay;
pub mod server;
pub mod transport;
pub mod tun;
pub mod wire;

pub use error::{Error, Result};

/// MTU of the virtual interface; inner IP packets never exceed this.
pub const TUN_MTU: usize = 1500;

/// Name of the virtual interface on both ends.
pub const TUN_IFACE: &str = "myvpn0";

/// The VPN subnet terminated by the server.
pub const VPN_SUBNET: &str = "10.0.0.0/24";

/// Netmask of the VPN subnet.
pub const VPN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// The server's inner address.
pub const SERVER_INNER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

/// Default inner address for a client.
pub const DEFAULT_CLIENT_INNER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

/// Default interval between keep-alive datagrams.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Resolve an endpoint string to a socket address.
///
/// Accepts `host:port` with either an IP or a DNS name, plus the bare
/// `:port` listen form, which binds all interfaces. IPv4 addresses are
/// preferred when a name resolves to both families, since the tunnel
/// carries IPv4 only.
pub fn resolve_endpoint(addr: &str) -> Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let resolved: Vec<SocketAddr> = normalized
        .to_socket_addrs()
        .map_err(|e| Error::config(format!("cannot resolve {addr}: {e}")))?
        .collect();

    resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| Error::config(format!("cannot resolve {addr}: no addresses returned")))
}
