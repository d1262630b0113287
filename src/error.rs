//! Error kinds for the DHT core.

use thiserror::Error;

use crate::id::Id;

/// Decoding failures for a single datagram. Always non-fatal: the
/// datagram is dropped and the sender receives no reply.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("buffer too short: need {need} bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },
    #[error("{count} trailing bytes after decoding a well-formed message")]
    TrailingBytes { count: usize },
    #[error("declared length {declared} does not match remaining buffer of {remaining} bytes")]
    LengthMismatch { declared: usize, remaining: usize },
    #[error("unsupported address family tag {0}")]
    UnknownAddressFamily(u8),
}

/// Top-level error type surfaced to the session and, where noted, to the
/// embedder's save/load callbacks.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("decoding failed: {0}")]
    Codec(#[from] CodecError),
    #[error("request to {0:?} timed out")]
    TimeOut(Id),
    #[error("value not found")]
    ValueNotFound,
    #[error("no peers available to perform the lookup")]
    MissingPeers,
    #[error("failed to send datagram: {0}")]
    SendError(#[from] std::io::Error),
    #[error("session was aborted")]
    Aborted,
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}
