//! In-process tracker shared by sessions living in the same program.
//!
//! Keeps one peer list per content identifier, the same bookkeeping a network
//! tracker does, minus the transport.

use super::{AnnounceRequest, AnnounceResponse, PeerInfo, ScrapeStats, TrackerClient};
use super::{TrackerError, TrackerEvent};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A peer registered in a swarm.
#[derive(Clone, Debug)]
struct Registration {
    peer_id: [u8; 20],
    addr: SocketAddr,
    seeding: bool,
    last_seen: Instant,
}

#[derive(Default)]
struct Registry {
    swarms: HashMap<[u8; 20], Vec<Registration>>,
    /// Completed downloads per content identifier.
    downloads: HashMap<[u8; 20], u32>,
}

pub struct MemoryTracker {
    registry: Mutex<Registry>,
    interval: u32,
    peer_ttl: Duration,
    max_peers: usize,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            interval: 1800,
            peer_ttl: Duration::from_secs(3600),
            max_peers: 50,
        }
    }

    /// Overrides how long a silent peer stays listed.
    pub fn with_peer_ttl(mut self, peer_ttl: Duration) -> Self {
        self.peer_ttl = peer_ttl;
        self
    }
}

impl TrackerClient for MemoryTracker {
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let mut guard = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let registry = &mut *guard;

        let swarm = registry.swarms.entry(request.content_id).or_default();
        let ttl = self.peer_ttl;
        swarm.retain(|p| p.last_seen.elapsed() < ttl);

        let addr = SocketAddr::new(
            request.ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            request.port,
        );
        debug!(
            "announce {:?} from {} for swarm of {}",
            request.event,
            addr,
            swarm.len()
        );

        if request.event == TrackerEvent::Stopped {
            swarm.retain(|p| p.peer_id != request.peer_id);
            return Ok(AnnounceResponse {
                interval: self.interval,
                peers: Vec::new(),
            });
        }

        let completed = request.event == TrackerEvent::Completed;
        let seeding = request.left == 0 || completed;
        let newly_completed = match swarm.iter_mut().find(|p| p.peer_id == request.peer_id) {
            Some(existing) => {
                let first_completion = completed && !existing.seeding;
                existing.addr = addr;
                existing.seeding |= seeding;
                existing.last_seen = Instant::now();
                first_completion
            }
            None => {
                swarm.push(Registration {
                    peer_id: request.peer_id,
                    addr,
                    seeding,
                    last_seen: Instant::now(),
                });
                completed
            }
        };

        let peers = swarm
            .iter()
            .filter(|p| p.peer_id != request.peer_id)
            .take(self.max_peers)
            .map(|p| PeerInfo {
                peer_id: Some(p.peer_id),
                addr: p.addr,
            })
            .collect();

        if newly_completed {
            *registry.downloads.entry(request.content_id).or_default() += 1;
        }

        Ok(AnnounceResponse {
            interval: self.interval,
            peers,
        })
    }

    fn scrape(&self, content_id: &[u8; 20]) -> Result<ScrapeStats, TrackerError> {
        let guard = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let swarm = guard
            .swarms
            .get(content_id)
            .ok_or(TrackerError::UnknownContent)?;

        let complete = swarm.iter().filter(|p| p.seeding).count() as u32;
        Ok(ScrapeStats {
            complete,
            incomplete: swarm.len() as u32 - complete,
            downloaded: guard.downloads.get(content_id).copied().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: [u8; 20] = [5u8; 20];

    fn announce(
        tracker: &MemoryTracker,
        peer: u8,
        port: u16,
        left: u64,
        event: TrackerEvent,
    ) -> AnnounceResponse {
        tracker
            .announce(&AnnounceRequest {
                content_id: CONTENT,
                peer_id: [peer; 20],
                port,
                ip: None,
                uploaded: 0,
                downloaded: 0,
                left,
                event,
            })
            .expect("announce should succeed")
    }

    #[test]
    fn test_started_lists_other_peers_only() {
        let tracker = MemoryTracker::new();
        let first = announce(&tracker, 1, 7001, 0, TrackerEvent::Started);
        assert!(first.peers.is_empty());

        let second = announce(&tracker, 2, 7002, 100, TrackerEvent::Started);
        assert_eq!(second.peers.len(), 1);
        assert_eq!(second.peers[0].peer_id, Some([1u8; 20]));
        assert_eq!(second.peers[0].addr, "127.0.0.1:7001".parse().unwrap());
    }

    #[test]
    fn test_stopped_removes_peer() {
        let tracker = MemoryTracker::new();
        announce(&tracker, 1, 7001, 0, TrackerEvent::Started);
        announce(&tracker, 1, 7001, 0, TrackerEvent::Stopped);
        let other = announce(&tracker, 2, 7002, 100, TrackerEvent::Started);
        assert!(other.peers.is_empty());
    }

    #[test]
    fn test_scrape_counts_seeders_and_completions_once() {
        let tracker = MemoryTracker::new();
        announce(&tracker, 1, 7001, 0, TrackerEvent::Started);
        announce(&tracker, 2, 7002, 100, TrackerEvent::Started);

        let stats = tracker.scrape(&CONTENT).unwrap();
        assert_eq!(stats.complete, 1);
        assert_eq!(stats.incomplete, 1);
        assert_eq!(stats.downloaded, 0);

        announce(&tracker, 2, 7002, 0, TrackerEvent::Completed);
        announce(&tracker, 2, 7002, 0, TrackerEvent::Completed);
        let stats = tracker.scrape(&CONTENT).unwrap();
        assert_eq!(stats.complete, 2);
        assert_eq!(stats.incomplete, 0);
        assert_eq!(stats.downloaded, 1);
    }

    #[test]
    fn test_scrape_unknown_content() {
        let tracker = MemoryTracker::new();
        assert!(matches!(
            tracker.scrape(&[0u8; 20]),
            Err(TrackerError::UnknownContent)
        ));
    }

    #[test]
    fn test_silent_peers_expire() {
        let tracker = MemoryTracker::new().with_peer_ttl(Duration::from_millis(20));
        announce(&tracker, 1, 7001, 0, TrackerEvent::Started);
        std::thread::sleep(Duration::from_millis(40));
        let response = announce(&tracker, 2, 7002, 100, TrackerEvent::Started);
        assert!(response.peers.is_empty());
    }
}
