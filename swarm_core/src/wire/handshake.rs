//! The fixed-layout opening exchange of a peer connection.

use super::WireError;
use crate::{ContentId, PeerId};
use bytes::{BufMut, Bytes, BytesMut};

/// Protocol identifier sent after the length byte.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Total size of an encoded handshake.
pub const HANDSHAKE_LEN: usize = 68;

const RESERVED_LEN: usize = 8;

/// A decoded handshake.
///
/// Layout, in order: one length byte (19), the protocol string, eight reserved
/// zero bytes, the 20-byte content identifier, the 20-byte sender peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub content_id: ContentId,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(content_id: ContentId, peer_id: PeerId) -> Self {
        Self {
            content_id,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_bytes(0, RESERVED_LEN);
        buf.put_slice(&self.content_id);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes a handshake without checking which content it is for.
    ///
    /// Reserved bytes are ignored and the peer id is taken as-is.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(WireError::HandshakeTooShort(data.len()));
        }
        if data[0] as usize != PROTOCOL.len() {
            return Err(WireError::InvalidProtocolLength(data[0]));
        }
        if &data[1..20] != PROTOCOL {
            return Err(WireError::InvalidProtocol);
        }

        let mut content_id = [0u8; 20];
        content_id.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            content_id,
            peer_id,
        })
    }

    /// Decodes a handshake and rejects it unless it names `expected`.
    pub fn decode_for(data: &[u8], expected: &ContentId) -> Result<Self, WireError> {
        let handshake = Self::decode(data)?;
        if &handshake.content_id != expected {
            return Err(WireError::ContentMismatch);
        }
        Ok(handshake)
    }
}
