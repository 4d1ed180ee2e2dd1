//! Encode/decode dispatch over the message types declared in [`super::message`].

use bytes::Bytes;

use super::header::{FrameHeader, HEADER_LEN};
use super::message::{
    AckFrameBody, DataFrame, Frame, MessageBody, TYPE_ACK, TYPE_CLOSE, TYPE_CLOSECONF, TYPE_CONF,
    TYPE_DATA, TYPE_DATA_FIN, TYPE_DIAL, TYPE_DIALCONF, TYPE_FLUSHCONF, TYPE_FLUSHSTREAM, TYPE_RST,
    TYPE_SKIPSTREAM,
};
use super::PacketError;

/// Encode `frame` onto the end of `out`.
pub fn encode(frame: &Frame, out: &mut Vec<u8>) {
    let header = FrameHeader::new(
        frame.body.type_byte(),
        frame.src_conn_id,
        frame.dst_conn_id,
    );
    header.encode(out);

    match &frame.body {
        MessageBody::Data(data) => encode_data(data, out),
        MessageBody::Ack(ack) => encode_ack(ack, out),
        MessageBody::Dial { sealed_box } => encode_sealed_box(sealed_box, out),
        MessageBody::DialConf { sealed_box } => encode_sealed_box(sealed_box, out),
        MessageBody::Conf | MessageBody::Rst | MessageBody::CloseConf => {}
        MessageBody::SkipStream { stream_id, offset } => {
            out.extend_from_slice(&stream_id.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
        }
        MessageBody::FlushStream { stream_id, offset } => {
            out.extend_from_slice(&stream_id.to_be_bytes());
            out.extend_from_slice(&offset.to_be_bytes());
        }
        MessageBody::FlushConf { stream_id } => {
            out.extend_from_slice(&stream_id.to_be_bytes());
        }
        MessageBody::Close { reason } => {
            out.extend_from_slice(&reason.to_be_bytes());
        }
    }
}

fn encode_data(data: &DataFrame, out: &mut Vec<u8>) {
    out.extend_from_slice(&data.stream_id.to_be_bytes());
    out.extend_from_slice(&data.packet_number.to_be_bytes());
    out.extend_from_slice(&data.offset.to_be_bytes());
    let length = u16::try_from(data.ciphertext.len()).expect("fragment exceeds u16 length");
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&data.ciphertext);
    out.extend_from_slice(&data.tag);
    out.extend_from_slice(&data.nonce);
}

fn encode_ack(ack: &AckFrameBody, out: &mut Vec<u8>) {
    out.extend_from_slice(&ack.largest.to_be_bytes());
    let count = u16::try_from(ack.ranges.len()).expect("ack range count exceeds u16");
    out.extend_from_slice(&count.to_be_bytes());
    for range in &ack.ranges {
        out.extend_from_slice(&range.to_be_bytes());
    }
}

fn encode_sealed_box(sealed_box: &Bytes, out: &mut Vec<u8>) {
    let length = u16::try_from(sealed_box.len()).expect("sealed box exceeds u16 length");
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(sealed_box);
}

/// Decode a single frame from `bytes`. The caller supplies exactly one
/// datagram's worth of bytes; trailing garbage is rejected rather than
/// silently ignored.
pub fn decode(bytes: &[u8]) -> Result<Frame, PacketError> {
    let (header, rest) = FrameHeader::decode(bytes)?;

    let body = match header.msg_type {
        TYPE_DATA => MessageBody::Data(decode_data(rest, false)?),
        TYPE_DATA_FIN => MessageBody::Data(decode_data(rest, true)?),
        TYPE_ACK => MessageBody::Ack(decode_ack(rest)?),
        TYPE_DIAL => MessageBody::Dial {
            sealed_box: decode_sealed_box(rest)?,
        },
        TYPE_DIALCONF => MessageBody::DialConf {
            sealed_box: decode_sealed_box(rest)?,
        },
        TYPE_CONF => {
            expect_empty(rest)?;
            MessageBody::Conf
        }
        TYPE_RST => {
            expect_empty(rest)?;
            MessageBody::Rst
        }
        TYPE_SKIPSTREAM => {
            let (stream_id, offset) = decode_stream_offset(rest)?;
            MessageBody::SkipStream { stream_id, offset }
        }
        TYPE_FLUSHSTREAM => {
            let (stream_id, offset) = decode_stream_offset(rest)?;
            MessageBody::FlushStream { stream_id, offset }
        }
        TYPE_FLUSHCONF => {
            if rest.len() != 2 {
                return Err(PacketError::TooShort {
                    needed: 2,
                    got: rest.len(),
                });
            }
            let stream_id = u16::from_be_bytes(rest[0..2].try_into().unwrap());
            MessageBody::FlushConf { stream_id }
        }
        TYPE_CLOSE => {
            if rest.len() != 2 {
                return Err(PacketError::TooShort {
                    needed: 2,
                    got: rest.len(),
                });
            }
            let reason = u16::from_be_bytes(rest[0..2].try_into().unwrap());
            MessageBody::Close { reason }
        }
        TYPE_CLOSECONF => {
            expect_empty(rest)?;
            MessageBody::CloseConf
        }
        found => return Err(PacketError::UnknownType { found }),
    };

    Ok(Frame {
        src_conn_id: header.src_conn_id,
        dst_conn_id: header.dst_conn_id,
        body,
    })
}

fn expect_empty(rest: &[u8]) -> Result<(), PacketError> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(PacketError::TrailingBytes { extra: rest.len() })
    }
}

fn decode_stream_offset(rest: &[u8]) -> Result<(u16, u64), PacketError> {
    const LEN: usize = 10;
    if rest.len() != LEN {
        return Err(PacketError::TooShort {
            needed: LEN,
            got: rest.len(),
        });
    }
    let stream_id = u16::from_be_bytes(rest[0..2].try_into().unwrap());
    let offset = u64::from_be_bytes(rest[2..10].try_into().unwrap());
    Ok((stream_id, offset))
}

fn decode_data(rest: &[u8], fin: bool) -> Result<DataFrame, PacketError> {
    const FIXED_LEN: usize = 2 + 8 + 8 + 2;
    const TRAILER_LEN: usize = 16 + 12;

    if rest.len() < FIXED_LEN {
        return Err(PacketError::TooShort {
            needed: FIXED_LEN,
            got: rest.len(),
        });
    }

    let stream_id = u16::from_be_bytes(rest[0..2].try_into().unwrap());
    let packet_number = u64::from_be_bytes(rest[2..10].try_into().unwrap());
    let offset = u64::from_be_bytes(rest[10..18].try_into().unwrap());
    let length = u16::from_be_bytes(rest[18..20].try_into().unwrap()) as usize;

    let body = &rest[FIXED_LEN..];
    if body.len() < length + TRAILER_LEN {
        return Err(PacketError::TruncatedPayload {
            declared: length,
            available: body.len(),
        });
    }

    let ciphertext = Bytes::copy_from_slice(&body[..length]);
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&body[length..length + 16]);
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&body[length + 16..length + TRAILER_LEN]);

    let trailing = body.len() - (length + TRAILER_LEN);
    if trailing != 0 {
        return Err(PacketError::TrailingBytes { extra: trailing });
    }

    Ok(DataFrame {
        stream_id,
        packet_number,
        offset,
        fin,
        ciphertext,
        tag,
        nonce,
    })
}

fn decode_ack(rest: &[u8]) -> Result<AckFrameBody, PacketError> {
    const FIXED_LEN: usize = 8 + 2;
    if rest.len() < FIXED_LEN {
        return Err(PacketError::TooShort {
            needed: FIXED_LEN,
            got: rest.len(),
        });
    }
    let largest = u64::from_be_bytes(rest[0..8].try_into().unwrap());
    let count = u16::from_be_bytes(rest[8..10].try_into().unwrap()) as usize;

    let body = &rest[FIXED_LEN..];
    let needed = count * 8;
    if body.len() < needed {
        return Err(PacketError::TooShort {
            needed,
            got: body.len(),
        });
    }

    let mut ranges = Vec::with_capacity(count);
    for chunk in body[..needed].chunks_exact(8) {
        ranges.push(u64::from_be_bytes(chunk.try_into().unwrap()));
    }

    let trailing = body.len() - needed;
    if trailing != 0 {
        return Err(PacketError::TrailingBytes { extra: trailing });
    }

    Ok(AckFrameBody { largest, ranges })
}

fn decode_sealed_box(rest: &[u8]) -> Result<Bytes, PacketError> {
    if rest.len() < 2 {
        return Err(PacketError::TooShort {
            needed: 2,
            got: rest.len(),
        });
    }
    let length = u16::from_be_bytes(rest[0..2].try_into().unwrap()) as usize;
    let body = &rest[2..];
    if body.len() < length {
        return Err(PacketError::TruncatedPayload {
            declared: length,
            available: body.len(),
        });
    }
    let trailing = body.len() - length;
    if trailing != 0 {
        return Err(PacketError::TrailingBytes { extra: trailing });
    }
    Ok(Bytes::copy_from_slice(&body[..length]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let mut bytes = Vec::new();
        encode(&frame, &mut bytes);
        let decoded = decode(&bytes).expect("decode failed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn data_frame_roundtrip() {
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body: MessageBody::Data(DataFrame {
                stream_id: 7,
                packet_number: 42,
                offset: 1024,
                fin: false,
                ciphertext: Bytes::from_static(b"hello world"),
                tag: [1u8; 16],
                nonce: [2u8; 12],
            }),
        });
    }

    #[test]
    fn data_fin_frame_roundtrip() {
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body: MessageBody::Data(DataFrame {
                stream_id: 7,
                packet_number: 43,
                offset: 2048,
                fin: true,
                ciphertext: Bytes::new(),
                tag: [3u8; 16],
                nonce: [4u8; 12],
            }),
        });
    }

    #[test]
    fn ack_frame_roundtrip() {
        roundtrip(Frame {
            src_conn_id: 5,
            dst_conn_id: 6,
            body: MessageBody::Ack(AckFrameBody {
                largest: 100,
                ranges: vec![10, 2, 5],
            }),
        });
    }

    #[test]
    fn dial_frame_roundtrip() {
        roundtrip(Frame {
            src_conn_id: 0,
            dst_conn_id: 0,
            body: MessageBody::Dial {
                sealed_box: Bytes::from_static(&[9u8; 64]),
            },
        });
    }

    #[test]
    fn skip_and_flush_stream_roundtrip() {
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 1,
            body: MessageBody::SkipStream {
                stream_id: 3,
                offset: 9000,
            },
        });
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 1,
            body: MessageBody::FlushStream {
                stream_id: 3,
                offset: 9000,
            },
        });
    }

    #[test]
    fn empty_body_frames_roundtrip() {
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body: MessageBody::Conf,
        });
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body: MessageBody::Rst,
        });
        roundtrip(Frame {
            src_conn_id: 1,
            dst_conn_id: 2,
            body: MessageBody::CloseConf,
        });
    }

    #[test]
    fn rejects_truncated_data_payload() {
        let mut bytes = Vec::new();
        encode(
            &Frame {
                src_conn_id: 1,
                dst_conn_id: 2,
                body: MessageBody::Data(DataFrame {
                    stream_id: 1,
                    packet_number: 1,
                    offset: 0,
                    fin: false,
                    ciphertext: Bytes::from_static(b"abcdef"),
                    tag: [0u8; 16],
                    nonce: [0u8; 12],
                }),
            },
            &mut bytes,
        );
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            decode(&bytes),
            Err(PacketError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[1] = 200;
        assert!(matches!(
            decode(&bytes),
            Err(PacketError::UnknownType { found: 200 })
        ));
    }
}
