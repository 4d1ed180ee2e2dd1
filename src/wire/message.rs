//! Message bodies for every wire type.

use bytes::Bytes;

/// Type byte for a non-final DATA fragment.
pub const TYPE_DATA: u8 = 0;
/// Type byte for the final fragment of a stream (FIN bit set).
pub const TYPE_DATA_FIN: u8 = 1;
/// Type byte for ACK.
pub const TYPE_ACK: u8 = 2;
/// Type byte for DIAL.
pub const TYPE_DIAL: u8 = 3;
/// Type byte for DIALCONF.
pub const TYPE_DIALCONF: u8 = 4;
/// Type byte for CONF.
pub const TYPE_CONF: u8 = 5;
/// Type byte for RST.
pub const TYPE_RST: u8 = 6;
/// Type byte for SKIPSTREAM.
pub const TYPE_SKIPSTREAM: u8 = 7;
/// Type byte for FLUSHSTREAM.
pub const TYPE_FLUSHSTREAM: u8 = 8;
/// Type byte for FLUSHCONF.
pub const TYPE_FLUSHCONF: u8 = 9;
/// Type byte for CLOSE.
pub const TYPE_CLOSE: u8 = 10;
/// Type byte for CLOSECONF.
pub const TYPE_CLOSECONF: u8 = 11;

/// A fully parsed frame: the common envelope plus its type-specific body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The sender's connection id.
    pub src_conn_id: u32,
    /// The id the sender believes is ours.
    pub dst_conn_id: u32,
    /// Type-specific payload.
    pub body: MessageBody,
}

/// A DATA (or DATA+FIN) fragment. `ciphertext` has length equal to the
/// plaintext it encrypts; the GCM tag and nonce trailer are carried
/// separately so the AEAD layer can address them without re-slicing.
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Stream this fragment belongs to.
    pub stream_id: u16,
    /// Connection-global, monotonically increasing packet number.
    pub packet_number: u64,
    /// Absolute byte offset of `ciphertext[0]` within the stream.
    pub offset: u64,
    /// Whether this is the final fragment of the stream.
    pub fin: bool,
    /// AEAD ciphertext (same length as the plaintext).
    pub ciphertext: Bytes,
    /// 16-byte GCM authentication tag.
    pub tag: [u8; 16],
    /// 12-byte nonce trailer (see the cryptographic framing design notes).
    pub nonce: [u8; 12],
}

/// A selective-ack frame: `largest` plus alternating (seen, gap) run lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrameBody {
    /// Largest packet number acknowledged.
    pub largest: u64,
    /// Alternating seen/gap run lengths, starting with a seen run anchored at `largest`.
    pub ranges: Vec<u64>,
}

/// Type-specific payload for every wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// DATA / DATA+FIN.
    Data(DataFrame),
    /// Selective ACK.
    Ack(AckFrameBody),
    /// Handshake initiation: sealed box of (static_pk ‖ ephemeral_pk).
    Dial { sealed_box: Bytes },
    /// Handshake confirmation: sealed box of ephemeral_pk.
    DialConf { sealed_box: Bytes },
    /// Handshake completion (empty body).
    Conf,
    /// Connection reset (empty body).
    Rst,
    /// Receiver announces it no longer wants bytes before `offset`.
    SkipStream {
        /// Target stream.
        stream_id: u16,
        /// Offset the receiver has already accounted for.
        offset: u64,
    },
    /// Sender announces bytes before `offset` will never be (re)sent.
    FlushStream {
        /// Target stream.
        stream_id: u16,
        /// New floor for `read_offset`.
        offset: u64,
    },
    /// Receiver acknowledges a FLUSHSTREAM.
    FlushConf {
        /// Target stream.
        stream_id: u16,
    },
    /// Graceful connection close.
    Close {
        /// Application-defined reason code.
        reason: u16,
    },
    /// Acknowledgment of CLOSE.
    CloseConf,
}

impl MessageBody {
    /// The wire type byte for this body.
    #[must_use]
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::Data(frame) => {
                if frame.fin {
                    TYPE_DATA_FIN
                } else {
                    TYPE_DATA
                }
            }
            Self::Ack(_) => TYPE_ACK,
            Self::Dial { .. } => TYPE_DIAL,
            Self::DialConf { .. } => TYPE_DIALCONF,
            Self::Conf => TYPE_CONF,
            Self::Rst => TYPE_RST,
            Self::SkipStream { .. } => TYPE_SKIPSTREAM,
            Self::FlushStream { .. } => TYPE_FLUSHSTREAM,
            Self::FlushConf { .. } => TYPE_FLUSHCONF,
            Self::Close { .. } => TYPE_CLOSE,
            Self::CloseConf => TYPE_CLOSECONF,
        }
    }
}
