//! Wire encoding: the 10-byte envelope and the 12 message bodies it carries.
//!
//! Every frame starts with [`header::FrameHeader`]; the remaining bytes are
//! interpreted per the type byte by [`codec::encode`]/[`codec::decode`].
//! Multi-byte integers are big-endian throughout.

mod codec;
mod header;
mod message;

pub use codec::{decode, encode};
pub use header::{FrameHeader, HEADER_LEN, VERSION};
pub use message::{
    AckFrameBody, DataFrame, Frame, MessageBody, TYPE_ACK, TYPE_CLOSE, TYPE_CLOSECONF, TYPE_CONF,
    TYPE_DATA, TYPE_DATA_FIN, TYPE_DIAL, TYPE_DIALCONF, TYPE_FLUSHCONF, TYPE_FLUSHSTREAM, TYPE_RST,
    TYPE_SKIPSTREAM,
};

use thiserror::Error;

/// Errors raised while decoding a frame off the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes were available than the format requires.
    #[error("frame too short: needed at least {needed} bytes, got {got}")]
    TooShort {
        /// Minimum bytes required at this parse point.
        needed: usize,
        /// Bytes actually available.
        got: usize,
    },
    /// The version byte was non-zero.
    #[error("unsupported version byte {found}")]
    BadVersion {
        /// The byte actually found.
        found: u8,
    },
    /// The type byte did not match any known message.
    #[error("unknown message type {found}")]
    UnknownType {
        /// The byte actually found.
        found: u8,
    },
    /// A DATA frame declared a `length` longer than the remaining buffer.
    #[error("data frame declares length {declared} but only {available} bytes remain")]
    TruncatedPayload {
        /// Length the frame header claimed.
        declared: usize,
        /// Bytes actually available after the header.
        available: usize,
    },
    /// Trailing bytes were left over after parsing a fixed-size body.
    #[error("{extra} unexpected trailing bytes after frame body")]
    TrailingBytes {
        /// Number of bytes left over.
        extra: usize,
    },
}
