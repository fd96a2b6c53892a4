//! Length-prefixed message frames.
//!
//! A frame is a 4-byte big-endian length `L`, then `L` bytes: one type byte
//! followed by the payload. `L == 0` is a keep-alive with no type byte.

use super::WireError;
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            _ => Err(WireError::UnknownMessageId(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// The type byte of this message, `None` for a keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    /// Encodes the message as a complete frame, length prefix included.
    pub fn encode(&self) -> Bytes {
        let payload_len = match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield(bits) => bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
        };

        let Some(id) = self.id() else {
            return Bytes::from_static(&[0, 0, 0, 0]);
        };

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + 1 + payload_len);
        buf.put_u32(1 + payload_len as u32);
        buf.put_u8(id as u8);

        match self {
            Message::Have { index } => buf.put_u32(*index),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            _ => {}
        }

        buf.freeze()
    }

    /// Decodes the body of a frame: everything after the length prefix.
    ///
    /// An empty body is a keep-alive. Variable-size payloads are sliced out of
    /// `body` without copying.
    pub fn decode(body: Bytes) -> Result<Self, WireError> {
        let Some(&type_byte) = body.first() else {
            return Ok(Message::KeepAlive);
        };
        let id = MessageId::try_from(type_byte)?;
        let payload = body.slice(1..);
        let payload_len = payload.len();
        let malformed = move || WireError::MalformedPayload {
            id,
            len: payload_len,
        };

        match id {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested => {
                if !payload.is_empty() {
                    return Err(malformed());
                }
                Ok(match id {
                    MessageId::Choke => Message::Choke,
                    MessageId::Unchoke => Message::Unchoke,
                    MessageId::Interested => Message::Interested,
                    _ => Message::NotInterested,
                })
            }
            MessageId::Have => {
                if payload.len() != 4 {
                    return Err(malformed());
                }
                Ok(Message::Have {
                    index: BigEndian::read_u32(&payload),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(payload)),
            MessageId::Request | MessageId::Cancel => {
                if payload.len() != 12 {
                    return Err(malformed());
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let length = BigEndian::read_u32(&payload[8..12]);
                Ok(if id == MessageId::Request {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                })
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(malformed());
                }
                Ok(Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload.slice(8..),
                })
            }
        }
    }
}

/// Reads a frame's length prefix and checks it against `max_len`.
pub fn frame_length(prefix: [u8; LENGTH_PREFIX_LEN], max_len: u32) -> Result<u32, WireError> {
    let len = BigEndian::read_u32(&prefix);
    if len > max_len {
        return Err(WireError::FrameTooLarge(len));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frame: &Bytes) -> Bytes {
        frame.slice(LENGTH_PREFIX_LEN..)
    }

    #[test]
    fn test_encode_state_messages() {
        assert_eq!(&Message::Choke.encode()[..], &[0, 0, 0, 1, 0]);
        assert_eq!(&Message::Unchoke.encode()[..], &[0, 0, 0, 1, 1]);
        assert_eq!(&Message::Interested.encode()[..], &[0, 0, 0, 1, 2]);
        assert_eq!(&Message::NotInterested.encode()[..], &[0, 0, 0, 1, 3]);
        assert_eq!(&Message::KeepAlive.encode()[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_request_layout() {
        let frame = Message::Request {
            index: 1,
            begin: 0x0102,
            length: 8192,
        }
        .encode();
        assert_eq!(
            &frame[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 1, 2, 0, 0, 0x20, 0]
        );
    }

    #[test]
    fn test_encode_piece_layout() {
        let frame = Message::Piece {
            index: 2,
            begin: 0,
            block: Bytes::from_static(b"abc"),
        }
        .encode();
        assert_eq!(&frame[..4], &[0, 0, 0, 12]);
        assert_eq!(frame[4], 7);
        assert_eq!(&frame[13..], b"abc");
    }

    #[test]
    fn test_decode_piece_and_have() {
        let piece = Message::Piece {
            index: 3,
            begin: 16,
            block: Bytes::from_static(&[9, 9, 9, 9]),
        };
        assert_eq!(Message::decode(body(&piece.encode())), Ok(piece));

        let have = Message::Have { index: 70_000 };
        assert_eq!(Message::decode(body(&have.encode())), Ok(have));
    }

    #[test]
    fn test_decode_bitfield_keeps_raw_bytes() {
        let frame = Message::Bitfield(Bytes::from_static(&[0b1010_0100])).encode();
        match Message::decode(body(&frame)) {
            Ok(Message::Bitfield(bits)) => assert_eq!(&bits[..], &[0b1010_0100]),
            other => panic!("unexpected decode result: {:?}", other),
        }
    }

    #[test]
    fn test_decode_empty_body_is_keep_alive() {
        assert_eq!(Message::decode(Bytes::new()), Ok(Message::KeepAlive));
    }

    #[test]
    fn test_decode_unknown_id() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[20, 0])),
            Err(WireError::UnknownMessageId(20))
        );
    }

    #[test]
    fn test_decode_rejects_wrong_fixed_payload_sizes() {
        assert_eq!(
            Message::decode(Bytes::from_static(&[4, 0, 0, 1])),
            Err(WireError::MalformedPayload {
                id: MessageId::Have,
                len: 3
            })
        );
        assert!(Message::decode(Bytes::from_static(&[0, 1])).is_err());
        assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 1])).is_err());
        assert!(Message::decode(Bytes::from_static(&[7, 0, 0, 0, 1])).is_err());
    }

    #[test]
    fn test_frame_length_limit() {
        assert_eq!(frame_length([0, 0, 0, 13], 1024), Ok(13));
        assert_eq!(
            frame_length([0, 1, 0, 0], 1024),
            Err(WireError::FrameTooLarge(65536))
        );
    }
}
