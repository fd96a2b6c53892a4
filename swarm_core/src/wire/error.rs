use super::MessageId;
use thiserror::Error;

/// Errors raised while decoding handshakes and message frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("handshake too short: {0} bytes")]
    HandshakeTooShort(usize),

    #[error("invalid protocol string length: {0}")]
    InvalidProtocolLength(u8),

    #[error("invalid protocol string")]
    InvalidProtocol,

    /// The peer is serving a different content item.
    #[error("content identifier mismatch")]
    ContentMismatch,

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("malformed {id:?} payload: {len} bytes")]
    MalformedPayload { id: MessageId, len: usize },

    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),
}
