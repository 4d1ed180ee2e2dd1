//! The 10-byte envelope shared by every wire message.

use super::PacketError;

/// Constant version marker; a non-zero first byte causes the frame to be
/// ignored by the caller before it even reaches [`FrameHeader::decode`].
pub const VERSION: u8 = 0;

/// Length of the common envelope: version(1) + type(1) + src_conn_id(4) + dst_conn_id(4).
pub const HEADER_LEN: usize = 10;

/// Parsed envelope common to every message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw type byte (for DATA frames, bit 0 is the FIN marker).
    pub msg_type: u8,
    /// The sender's connection id.
    pub src_conn_id: u32,
    /// The id the sender believes is ours.
    pub dst_conn_id: u32,
}

impl FrameHeader {
    /// Build a header for the given type byte and connection ids.
    #[must_use]
    pub const fn new(msg_type: u8, src_conn_id: u32, dst_conn_id: u32) -> Self {
        Self {
            msg_type,
            src_conn_id,
            dst_conn_id,
        }
    }

    /// Append the 10-byte envelope to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(VERSION);
        out.push(self.msg_type);
        out.extend_from_slice(&self.src_conn_id.to_be_bytes());
        out.extend_from_slice(&self.dst_conn_id.to_be_bytes());
    }

    /// Parse the envelope from the front of `bytes`, returning the header
    /// and the remaining slice.
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::TooShort {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        if bytes[0] != VERSION {
            return Err(PacketError::BadVersion { found: bytes[0] });
        }
        let msg_type = bytes[1];
        let src_conn_id = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        let dst_conn_id = u32::from_be_bytes(bytes[6..10].try_into().unwrap());
        Ok((
            Self {
                msg_type,
                src_conn_id,
                dst_conn_id,
            },
            &bytes[HEADER_LEN..],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = FrameHeader::new(3, 0xAABB_CCDD, 0x1122_3344);
        let mut bytes = Vec::new();
        header.encode(&mut bytes);
        assert_eq!(bytes.len(), HEADER_LEN);
        let (decoded, rest) = FrameHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn rejects_nonzero_version() {
        let mut bytes = vec![1u8; HEADER_LEN];
        bytes[0] = 1;
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(PacketError::BadVersion { found: 1 })
        ));
    }

    #[test]
    fn rejects_short_buffer() {
        let bytes = vec![0u8; 4];
        assert!(matches!(
            FrameHeader::decode(&bytes),
            Err(PacketError::TooShort { .. })
        ));
    }
}
