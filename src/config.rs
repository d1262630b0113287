//! Tunable parameters, with the defaults mandated by the wire contract.

use std::time::Duration;

/// Default UDP port bound by both the IPv4 and IPv6 listeners.
pub const DEFAULT_PORT: u16 = 27980;

/// Replication / bucket-size parameter (`K`).
pub const DEFAULT_K: usize = 20;

/// Lookup concurrency parameter (`alpha`).
pub const DEFAULT_ALPHA: usize = 3;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// IPv4 listen address, e.g. `0.0.0.0:27980`.
    pub listen_v4: std::net::SocketAddr,
    /// IPv6 listen address, e.g. `[::]:27980`.
    pub listen_v6: std::net::SocketAddr,
    pub k: usize,
    pub alpha: usize,
    pub request_timeout: Duration,
    pub ping_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            listen_v4: std::net::SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            listen_v6: std::net::SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), DEFAULT_PORT),
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            request_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(1),
        }
    }
}
