//! Wire format: one header followed by a type-specific body.
//!
//! Layout (all integers little-endian unless noted):
//!
//! ```text
//! header:  version: u8 | type: u8 | source_id: [u8; 20] | random_token: [u8; 20]
//! ```
//!
//! Variable-length fields (peer lists, values) are prefixed with a `u16`
//! element/byte count. Endpoints are encoded as a one-byte family tag
//! (`4` = IPv4, `6` = IPv6) followed by 4 or 16 address bytes and a `u16`
//! port. IDs and hashes are always the raw 20 bytes, never length-prefixed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::CodecError;
use crate::id::{Id, ID_LEN};
use crate::peer::Peer;

pub const WIRE_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 1 + ID_LEN + ID_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    PingResponse = 1,
    FindPeerRequest = 2,
    FindPeerResponse = 3,
    FindValueRequest = 4,
    FindValueResponse = 5,
    StoreValueRequest = 6,
}

impl MessageType {
    fn of(message: &Message) -> Self {
        match message {
            Message::Ping => MessageType::Ping,
            Message::PingResponse => MessageType::PingResponse,
            Message::FindPeerRequest { .. } => MessageType::FindPeerRequest,
            Message::FindPeerResponse { .. } => MessageType::FindPeerResponse,
            Message::FindValueRequest { .. } => MessageType::FindValueRequest,
            Message::FindValueResponse { .. } => MessageType::FindValueResponse,
            Message::StoreValueRequest { .. } => MessageType::StoreValueRequest,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0 => MessageType::Ping,
            1 => MessageType::PingResponse,
            2 => MessageType::FindPeerRequest,
            3 => MessageType::FindPeerResponse,
            4 => MessageType::FindValueRequest,
            5 => MessageType::FindValueResponse,
            6 => MessageType::StoreValueRequest,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// The header every datagram begins with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: MessageType,
    pub source_id: Id,
    pub random_token: Id,
}

/// One of the five RPC bodies defined by the protocol. A `FindValueRequest`
/// is answered with either `FindValueResponse` (hit) or `FindPeerResponse`
/// (miss, fall back to closer peers) — both are valid expected replies.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Ping,
    PingResponse,
    FindPeerRequest { target: Id },
    FindPeerResponse { peers: Vec<Peer> },
    FindValueRequest { key: Id },
    FindValueResponse { data: Vec<u8> },
    StoreValueRequest { key_hash: Id, value: Vec<u8> },
}

/// A header together with its body: what actually goes out on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub message: Message,
}

impl Envelope {
    pub fn new(source_id: Id, random_token: Id, message: Message) -> Self {
        Envelope {
            header: Header {
                version: WIRE_VERSION,
                message_type: MessageType::of(&message),
                source_id,
                random_token,
            },
            message,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 64);
        out.push(self.header.version);
        out.push(self.header.message_type as u8);
        out.extend_from_slice(self.header.source_id.as_bytes());
        out.extend_from_slice(self.header.random_token.as_bytes());
        encode_body(&self.message, &mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::BufferTooShort {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }
        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let message_type = MessageType::try_from(buf[1])?;
        let source_id = read_id(&buf[2..2 + ID_LEN]);
        let random_token = read_id(&buf[2 + ID_LEN..2 + 2 * ID_LEN]);
        let mut cursor = Cursor {
            buf,
            pos: HEADER_LEN,
        };
        let message = decode_body(message_type, &mut cursor)?;
        if cursor.pos != buf.len() {
            return Err(CodecError::TrailingBytes {
                count: buf.len() - cursor.pos,
            });
        }
        Ok(Envelope {
            header: Header {
                version,
                message_type,
                source_id,
                random_token,
            },
            message,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < self.pos + len {
            return Err(CodecError::BufferTooShort {
                need: self.pos + len,
                have: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_id(&mut self) -> Result<Id, CodecError> {
        Ok(read_id(self.take(ID_LEN)?))
    }
}

fn read_id(bytes: &[u8]) -> Id {
    let mut array = [0u8; ID_LEN];
    array.copy_from_slice(bytes);
    Id::from_bytes(array)
}

fn encode_endpoint(addr: &SocketAddr, out: &mut Vec<u8>) {
    match addr.ip() {
        IpAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_le_bytes());
}

fn decode_endpoint(cursor: &mut Cursor) -> Result<SocketAddr, CodecError> {
    let family = cursor.take_u8()?;
    let ip: IpAddr = match family {
        4 => {
            let bytes = cursor.take(4)?;
            Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).into()
        }
        6 => {
            let bytes = cursor.take(16)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ipv6Addr::from(octets).into()
        }
        other => return Err(CodecError::UnknownAddressFamily(other)),
    };
    let port = cursor.take_u16()?;
    Ok(SocketAddr::new(ip, port))
}

fn encode_body(message: &Message, out: &mut Vec<u8>) {
    match message {
        Message::Ping | Message::PingResponse => {}
        Message::FindPeerRequest { target } => out.extend_from_slice(target.as_bytes()),
        Message::FindPeerResponse { peers } => {
            out.extend_from_slice(&(peers.len() as u16).to_le_bytes());
            for peer in peers {
                out.extend_from_slice(peer.id.as_bytes());
                encode_endpoint(&peer.addr, out);
            }
        }
        Message::FindValueRequest { key } => out.extend_from_slice(key.as_bytes()),
        Message::FindValueResponse { data } => {
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
            out.extend_from_slice(data);
        }
        Message::StoreValueRequest { key_hash, value } => {
            out.extend_from_slice(key_hash.as_bytes());
            out.extend_from_slice(&(value.len() as u16).to_le_bytes());
            out.extend_from_slice(value);
        }
    }
}

fn decode_body(message_type: MessageType, cursor: &mut Cursor) -> Result<Message, CodecError> {
    Ok(match message_type {
        MessageType::Ping => Message::Ping,
        MessageType::PingResponse => Message::PingResponse,
        MessageType::FindPeerRequest => Message::FindPeerRequest {
            target: cursor.take_id()?,
        },
        MessageType::FindPeerResponse => {
            let count = cursor.take_u16()? as usize;
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                let id = cursor.take_id()?;
                let addr = decode_endpoint(cursor)?;
                peers.push(Peer::new(id, addr));
            }
            Message::FindPeerResponse { peers }
        }
        MessageType::FindValueRequest => Message::FindValueRequest {
            key: cursor.take_id()?,
        },
        MessageType::FindValueResponse => {
            let len = cursor.take_u16()? as usize;
            let data = cursor.take(len)?.to_vec();
            Message::FindValueResponse { data }
        }
        MessageType::StoreValueRequest => {
            let key_hash = cursor.take_id()?;
            let len = cursor.take_u16()? as usize;
            let value = cursor.take(len)?.to_vec();
            Message::StoreValueRequest { key_hash, value }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn rand_id() -> Id {
        Id::random()
    }

    #[test]
    fn header_round_trips() {
        let envelope = Envelope::new(
            rand_id(),
            rand_id(),
            Message::FindValueResponse {
                data: vec![1, 2, 3],
            },
        );
        let bytes = envelope.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.header, envelope.header);
        assert_eq!(decoded.message, envelope.message);
    }

    #[test]
    fn find_peer_response_with_ten_peers_round_trips() {
        let mut peers = Vec::new();
        for i in 0..10u16 {
            let addr: SocketAddr = if i % 2 == 0 {
                format!("[::1]:{}", 1024 + i).parse().unwrap()
            } else {
                format!("127.0.0.1:{}", 1024 + i).parse().unwrap()
            };
            peers.push(Peer::new(rand_id(), addr));
        }
        let envelope = Envelope::new(rand_id(), rand_id(), Message::FindPeerResponse { peers });
        let bytes = envelope.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.message, envelope.message);
    }

    #[test]
    fn find_value_response_with_4096_bytes_round_trips() {
        let data = vec![0xABu8; 4096];
        let envelope = Envelope::new(rand_id(), rand_id(), Message::FindValueResponse { data });
        let bytes = envelope.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.message, envelope.message);
    }

    #[test]
    fn rejects_trailing_bytes() {
        let envelope = Envelope::new(rand_id(), rand_id(), Message::Ping);
        let mut bytes = envelope.encode();
        bytes.push(0xFF);
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::TrailingBytes { count: 1 })
        ));
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(
            Envelope::decode(&[0u8; 3]),
            Err(CodecError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let envelope = Envelope::new(rand_id(), rand_id(), Message::Ping);
        let mut bytes = envelope.encode();
        bytes[0] = 99;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let envelope = Envelope::new(rand_id(), rand_id(), Message::Ping);
        let mut bytes = envelope.encode();
        bytes[1] = 200;
        assert!(matches!(
            Envelope::decode(&bytes),
            Err(CodecError::UnknownMessageType(200))
        ));
    }

    #[quickcheck_macros::quickcheck]
    fn find_value_response_round_trips_for_any_payload(data: Vec<u8>) -> bool {
        let envelope = Envelope::new(rand_id(), rand_id(), Message::FindValueResponse { data });
        let bytes = envelope.encode();
        Envelope::decode(&bytes)
            .map(|decoded| decoded.message == envelope.message)
            .unwrap_or(false)
    }

    #[quickcheck_macros::quickcheck]
    fn store_value_request_round_trips_for_any_payload(value: Vec<u8>) -> bool {
        let envelope = Envelope::new(
            rand_id(),
            rand_id(),
            Message::StoreValueRequest {
                key_hash: rand_id(),
                value,
            },
        );
        let bytes = envelope.encode();
        Envelope::decode(&bytes)
            .map(|decoded| decoded.message == envelope.message)
            .unwrap_or(false)
    }

    #[test]
    fn store_value_request_round_trips() {
        let envelope = Envelope::new(
            rand_id(),
            rand_id(),
            Message::StoreValueRequest {
                key_hash: rand_id(),
                value: b"hello world".to_vec(),
            },
        );
        let bytes = envelope.encode();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.message, envelope.message);
    }
}
