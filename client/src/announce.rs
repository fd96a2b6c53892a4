use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use swarm_core::{ContentId, PeerId};
use tracker::{
    AnnounceRequest, AnnounceResponse, ScrapeStats, TrackerClient, TrackerError, TrackerEvent,
};

/// Transfer counters reported with every announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Talks to the tracker on behalf of one session.
///
/// Tracker clients are blocking, so every call is moved onto the blocking pool.
pub struct Announcer {
    tracker: Arc<dyn TrackerClient>,
    content_id: ContentId,
    peer_id: PeerId,
    ip: Option<IpAddr>,
    port: AtomicU16,
}

impl Announcer {
    pub fn new(
        tracker: Arc<dyn TrackerClient>,
        content_id: ContentId,
        peer_id: PeerId,
        ip: Option<IpAddr>,
    ) -> Self {
        Self {
            tracker,
            content_id,
            peer_id,
            ip,
            port: AtomicU16::new(0),
        }
    }

    /// Records the port the listener ended up on.
    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    pub async fn announce(
        &self,
        event: TrackerEvent,
        progress: Progress,
    ) -> Result<AnnounceResponse, TrackerError> {
        let request = AnnounceRequest {
            content_id: self.content_id,
            peer_id: self.peer_id,
            port: self.port.load(Ordering::Relaxed),
            ip: self.ip,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
        };
        let tracker = self.tracker.clone();
        tokio::task::spawn_blocking(move || tracker.announce(&request))
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?
    }

    pub async fn scrape(&self) -> Result<ScrapeStats, TrackerError> {
        let tracker = self.tracker.clone();
        let content_id = self.content_id;
        tokio::task::spawn_blocking(move || tracker.scrape(&content_id))
            .await
            .map_err(|e| TrackerError::Unavailable(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tracker::{MemoryTracker, StaticTracker};

    #[tokio::test]
    async fn test_announce_uses_recorded_port() {
        let tracker = Arc::new(MemoryTracker::new());
        let first = Announcer::new(tracker.clone(), [1; 20], [2; 20], None);
        first.set_port(7000);
        first
            .announce(TrackerEvent::Started, Progress::default())
            .await
            .unwrap();

        let second = Announcer::new(tracker, [1; 20], [3; 20], None);
        let response = second
            .announce(TrackerEvent::Started, Progress::default())
            .await
            .unwrap();
        let expected: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr, expected);
        assert_eq!(response.peers[0].peer_id, Some([2; 20]));
    }

    #[tokio::test]
    async fn test_scrape_error_is_passed_through() {
        let announcer = Announcer::new(Arc::new(StaticTracker::new(vec![])), [0; 20], [0; 20], None);
        assert!(matches!(
            announcer.scrape().await,
            Err(TrackerError::Unsupported(_))
        ));
    }
}
