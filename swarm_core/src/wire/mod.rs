//! Peer wire protocol.
//!
//! Two layouts travel over a peer connection: the fixed 68-byte handshake sent
//! once by each side, then length-prefixed message frames. Everything here is
//! a pure transform between bytes and typed values; reading from and writing
//! to sockets is the caller's business.

mod error;
pub mod handshake;
pub mod message;

pub use error::WireError;
pub use handshake::{HANDSHAKE_LEN, Handshake, PROTOCOL};
pub use message::{LENGTH_PREFIX_LEN, Message, MessageId, frame_length};
