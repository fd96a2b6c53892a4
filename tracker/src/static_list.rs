//! A tracker stand-in that always answers with the same peers.

use super::{AnnounceRequest, AnnounceResponse, PeerInfo, ScrapeStats, TrackerClient};
use super::{TrackerError, TrackerEvent};
use std::net::SocketAddr;
use std::sync::Mutex;

/// Returns a fixed peer list and remembers the events it was sent.
///
/// Used when peers are given on the command line instead of discovered.
pub struct StaticTracker {
    peers: Vec<PeerInfo>,
    events: Mutex<Vec<TrackerEvent>>,
}

impl StaticTracker {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            peers: addrs
                .into_iter()
                .map(|addr| PeerInfo {
                    peer_id: None,
                    addr,
                })
                .collect(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Events announced so far, oldest first.
    pub fn events(&self) -> Vec<TrackerEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TrackerClient for StaticTracker {
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.event);

        let peers = match request.event {
            TrackerEvent::Stopped => Vec::new(),
            _ => self.peers.clone(),
        };
        Ok(AnnounceResponse {
            interval: 0,
            peers,
        })
    }

    fn scrape(&self, _content_id: &[u8; 20]) -> Result<ScrapeStats, TrackerError> {
        Err(TrackerError::Unsupported("scrape"))
    }
}
