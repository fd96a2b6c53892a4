//! Tracker boundary.
//!
//! A session only needs two things from a tracker: a peer list when it starts,
//! and somewhere to report `started`/`stopped`/`completed`. How that request
//! travels (HTTP, UDP, in-process) is up to the `TrackerClient` implementation.

use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

pub mod memory;
pub mod static_list;

pub use memory::MemoryTracker;
pub use static_list::StaticTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub content_id: [u8; 20],
    pub peer_id: [u8; 20],
    /// Port the announcing peer accepts connections on.
    pub port: u16,
    /// Address to advertise; the tracker decides when absent.
    pub ip: Option<IpAddr>,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

/// A peer handed out by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Option<[u8; 20]>,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    /// Seconds the tracker would like between announces.
    pub interval: u32,
    pub peers: Vec<PeerInfo>,
}

/// Swarm statistics returned by a scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Peers holding the whole content.
    pub complete: u32,
    /// Peers still downloading.
    pub incomplete: u32,
    /// Completed downloads ever reported.
    pub downloaded: u32,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker does not know this content")]
    UnknownContent,

    #[error("{0} is not supported by this tracker")]
    Unsupported(&'static str),

    #[error("tracker unavailable: {0}")]
    Unavailable(String),
}

/// The calls a session makes on its tracker.
///
/// Both calls may block, so async callers should run them on a blocking
/// thread.
pub trait TrackerClient: Send + Sync {
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;

    fn scrape(&self, content_id: &[u8; 20]) -> Result<ScrapeStats, TrackerError>;
}
