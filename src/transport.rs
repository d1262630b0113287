//! Dual-stack UDP transport: one socket bound on an IPv4 endpoint, one on
//! an IPv6 endpoint, both on the configured port. Mirrors the original
//! implementation's `create_sockets`/`graceful_close_socket` pair, built
//! on `tokio::net::UdpSocket` rather than a manual reactor.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::error::DhtError;

/// Datagrams larger than this are rejected as malformed rather than
/// silently truncated; comfortably inside the 64 KiB UDP ceiling and
/// generous for the ~4 KiB values this crate's tests exercise.
pub const MAX_DATAGRAM_LEN: usize = 64 * 1024;

pub struct Transport {
    v4: UdpSocket,
    v6: UdpSocket,
}

pub enum Received {
    Datagram { from: SocketAddr, bytes: Vec<u8> },
    /// The OS reported more bytes were available than fit in our buffer;
    /// per the wire contract this is reported, not decoded.
    Truncated { from: SocketAddr },
}

impl Transport {
    pub async fn bind(listen_v4: SocketAddr, listen_v6: SocketAddr) -> Result<Self, DhtError> {
        let v4 = UdpSocket::bind(listen_v4).await?;
        let v6 = UdpSocket::bind(listen_v6).await?;
        Ok(Transport { v4, v6 })
    }

    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr), DhtError> {
        Ok((self.v4.local_addr()?, self.v6.local_addr()?))
    }

    /// Fire-and-forget send; fails only on immediate OS-level rejection.
    pub async fn send(&self, to: SocketAddr, bytes: &[u8]) -> Result<(), DhtError> {
        let socket = if to.is_ipv4() { &self.v4 } else { &self.v6 };
        socket.send_to(bytes, to).await?;
        Ok(())
    }

    /// Suspends until a datagram arrives on either socket.
    pub async fn recv(&self) -> Result<Received, DhtError> {
        let mut buf_v4 = vec![0u8; MAX_DATAGRAM_LEN];
        let mut buf_v6 = vec![0u8; MAX_DATAGRAM_LEN];
        tokio::select! {
            result = self.v4.recv_from(&mut buf_v4) => Self::finish(result, buf_v4),
            result = self.v6.recv_from(&mut buf_v6) => Self::finish(result, buf_v6),
        }
    }

    fn finish(
        result: std::io::Result<(usize, SocketAddr)>,
        mut buf: Vec<u8>,
    ) -> Result<Received, DhtError> {
        let (len, from) = result?;
        if len == buf.len() {
            // a datagram that exactly fills the buffer may have been
            // truncated by the OS; treat it as such rather than risk
            // silently decoding a partial message.
            return Ok(Received::Truncated { from });
        }
        buf.truncate(len);
        Ok(Received::Datagram { from, bytes: buf })
    }

    /// Releases both sockets. Called on every `Session` exit path.
    pub fn shutdown(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_v4() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn any_v6() -> SocketAddr {
        "[::1]:0".parse().unwrap()
    }

    #[tokio::test]
    async fn send_and_recv_round_trip_on_v4() {
        let a = Transport::bind(any_v4(), any_v6()).await.unwrap();
        let b = Transport::bind(any_v4(), any_v6()).await.unwrap();
        let (b_v4, _b_v6) = b.local_addrs().unwrap();
        a.send(b_v4, b"hello").await.unwrap();
        match b.recv().await.unwrap() {
            Received::Datagram { bytes, .. } => assert_eq!(bytes, b"hello"),
            Received::Truncated { .. } => panic!("unexpected truncation"),
        }
    }

    #[tokio::test]
    async fn send_and_recv_round_trip_on_v6() {
        let a = Transport::bind(any_v4(), any_v6()).await.unwrap();
        let b = Transport::bind(any_v4(), any_v6()).await.unwrap();
        let (_b_v4, b_v6) = b.local_addrs().unwrap();
        a.send(b_v6, b"hello-v6").await.unwrap();
        match b.recv().await.unwrap() {
            Received::Datagram { bytes, .. } => assert_eq!(bytes, b"hello-v6"),
            Received::Truncated { .. } => panic!("unexpected truncation"),
        }
    }
}
