//! Layered error types for the transport stack.
//!
//! Each subsystem owns a narrow `thiserror` enum; [`Error`] composes them for
//! callers that don't care which layer failed. Handlers that DO care about
//! policy (drop silently vs. send RST vs. reset-and-close) match on the
//! specific variant rather than relying on `Display` text.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::wire::PacketError;

/// Errors surfaced while decoding or validating a wire frame.
pub use crate::wire::PacketError as WireError;

/// Stream-level protocol violations (bad offsets, stale acks, etc.).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Application tried to send on a stream whose send-queue already holds
    /// more than [`crate::config::TransportConfig::max_send_queue_bytes`].
    #[error("send backpressure: stream {stream_id} queue would exceed {limit} bytes")]
    Backpressure {
        /// Offending stream.
        stream_id: u16,
        /// Configured cap.
        limit: u64,
    },
    /// An ack or data frame referenced a stream that no longer exists.
    #[error("unknown stream {stream_id}")]
    UnknownStream {
        /// Offending stream.
        stream_id: u16,
    },
}

/// Handshake state-machine misuse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// A DIALCONF/CONF carried connection ids that don't match ours.
    #[error("connection id mismatch: expected ({expected_src:#x}, {expected_dst:#x}), got ({got_src:#x}, {got_dst:#x})")]
    ConnIdMismatch {
        /// Our expected src id.
        expected_src: u32,
        /// Our expected dst id.
        expected_dst: u32,
        /// Received src id.
        got_src: u32,
        /// Received dst id.
        got_dst: u32,
    },
    /// Handshake did not complete before the exponential backoff cap elapsed.
    #[error("handshake timed out waiting for peer")]
    Timeout,
}

/// Unified transport-level error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed wire frame (bounds, unknown type, bad version byte).
    #[error(transparent)]
    Wire(#[from] PacketError),
    /// AEAD/KDF/handshake-crypto failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Stream-level protocol error.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Handshake state-machine error.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// Underlying socket I/O failure.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of an application `send()` call that the app should branch on,
/// as distinct from the internal protocol errors above.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The stream's unsent+unacked queue would exceed its configured cap.
    #[error("send backpressure: stream {stream_id} queue would exceed {limit} bytes")]
    Backpressure {
        /// Offending stream.
        stream_id: u16,
        /// Configured cap.
        limit: u64,
    },
    /// The connection has not completed its handshake yet.
    #[error("connection is not established")]
    NotEstablished,
}

/// Crate-wide error type and result alias.
pub type Error = TransportError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
