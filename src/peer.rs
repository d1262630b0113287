//! Peer identity and endpoint addressing.

use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::DhtError;
use crate::id::Id;

/// A remote node: its 160-bit identity plus the endpoint it is reachable
/// on. Equality and ordering (for candidate sets) are by `id` alone.
#[derive(Clone, Copy, Debug)]
pub struct Peer {
    pub id: Id,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Peer { id, addr }
    }

    /// Parses a human-facing `host:port` endpoint into a [`SocketAddr`],
    /// resolving hostnames the way a CLI caller expects. This is an
    /// embedder convenience, not something the wire protocol needs: the
    /// wire always carries resolved addresses.
    pub fn parse_addr(endpoint: &str) -> Result<SocketAddr, DhtError> {
        endpoint
            .to_socket_addrs()
            .map_err(|_| DhtError::InvalidEndpoint(endpoint.to_string()))?
            .next()
            .ok_or_else(|| DhtError::InvalidEndpoint(endpoint.to_string()))
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Peer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipv4_endpoint() {
        let addr = Peer::parse_addr("127.0.0.1:27980").unwrap();
        assert_eq!(addr.port(), 27980);
    }

    #[test]
    fn rejects_garbage_endpoint() {
        assert!(Peer::parse_addr("not-an-endpoint").is_err());
    }

    #[test]
    fn equality_ignores_address() {
        let id = Id::random();
        let a = Peer::new(id, "127.0.0.1:1".parse().unwrap());
        let b = Peer::new(id, "127.0.0.1:2".parse().unwrap());
        assert_eq!(a, b);
    }
}
