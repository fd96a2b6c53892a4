//! Core library for the swarm client.
//!
//! This crate holds the pieces of the peer protocol that do no I/O of their own:
//! the wire codec, the packed availability bitfield, the resolved content
//! descriptor and the token bucket used to throttle uploads.

pub mod bitfield;
pub mod content;
pub mod rate_limit;
pub mod wire;

pub use bitfield::Bitfield;
pub use content::{ContentInfo, Sha256Digest};
pub use rate_limit::TokenBucket;

/// Opaque 20-byte identifier a peer announces in its handshake.
pub type PeerId = [u8; 20];

/// 20-byte identifier of the shared content, carried in every handshake.
pub type ContentId = [u8; 20];
