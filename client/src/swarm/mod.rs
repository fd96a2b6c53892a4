//! Cross-connection coordination for one content item.
//!
//! Every connection of a session shares one `SwarmCoordinator`. It owns the
//! piece store together with what the swarm advertises (per-peer bitfields and
//! piece frequencies) behind a single lock, so piece selection always sees a
//! consistent view. No socket I/O happens while that lock is held.

mod state;

pub use state::{Acceptance, BLOCK_LENGTH, BlockRequest, SwarmState};

use crate::announce::{Announcer, Progress};
use crate::error::StoreError;
use crate::storage::{Piece, PieceStore};
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use swarm_core::{Bitfield, ContentInfo, PeerId};
use tokio::sync::{Mutex, MutexGuard, broadcast, watch};
use tracing::{debug, error, info, warn};
use tracker::TrackerEvent;

/// Where a session stands with respect to holding the whole content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    InProgress,
    /// All pieces held. Carries the export path when the content was
    /// downloaded; seeding sessions start here with `None`.
    Complete(Option<PathBuf>),
    /// Every piece arrived but the export failed.
    Failed(String),
}

/// Counters exposed through session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub held_pieces: usize,
    pub total_pieces: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub connected_peers: usize,
}

pub struct SwarmCoordinator {
    content: ContentInfo,
    local_id: PeerId,
    state: Mutex<SwarmState>,
    announcer: Arc<Announcer>,
    export_path: Option<PathBuf>,
    haves: broadcast::Sender<u32>,
    completion: watch::Sender<Completion>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl SwarmCoordinator {
    pub fn new(
        content: ContentInfo,
        store: PieceStore,
        local_id: PeerId,
        announcer: Arc<Announcer>,
        export_path: Option<PathBuf>,
    ) -> Self {
        // A download with nothing to fetch still has to export and announce.
        let initial = if store.is_complete() && export_path.is_none() {
            Completion::Complete(None)
        } else {
            Completion::InProgress
        };
        let (haves, _) = broadcast::channel(256);
        let (completion, _) = watch::channel(initial);
        Self {
            content,
            local_id,
            state: Mutex::new(SwarmState::new(store)),
            announcer,
            export_path,
            haves,
            completion,
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        }
    }

    pub fn content(&self) -> &ContentInfo {
        &self.content
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Claims `peer` for a new connection. Fails for our own id and for peers
    /// that already have an active connection.
    pub async fn register_peer(&self, peer: PeerId) -> bool {
        if peer == self.local_id {
            return false;
        }
        self.state.lock().await.register(peer)
    }

    /// Stores the bitfield a peer sent and returns whether we want anything
    /// from it. Short or long payloads are padded or truncated.
    pub async fn report_bitfield(&self, peer: PeerId, payload: &[u8]) -> bool {
        let bitfield = Bitfield::from_bytes(payload, self.content.total_pieces());
        self.state.lock().await.report_bitfield(peer, bitfield)
    }

    pub async fn report_have(&self, peer: PeerId, index: u32) -> bool {
        self.state.lock().await.report_have(peer, index)
    }

    pub async fn is_interesting(&self, peer: &PeerId) -> bool {
        self.state.lock().await.is_interesting(peer)
    }

    pub async fn select_rarest(&self) -> Option<u32> {
        self.state.lock().await.select_rarest()
    }

    pub async fn next_block_request(&self, peer: &PeerId) -> Option<BlockRequest> {
        self.state.lock().await.next_block_request(peer)
    }

    /// Gives back every piece reserved for `peer`, e.g. after it choked us.
    pub async fn release_requests(&self, peer: &PeerId) {
        self.state.lock().await.release(peer);
    }

    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.state.lock().await.remove_peer(peer);
    }

    pub async fn rebuild_frequencies(&self) {
        self.state.lock().await.rebuild_frequencies();
    }

    pub async fn local_bitfield(&self) -> Bitfield {
        self.state.lock().await.store.bitfield()
    }

    pub async fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StoreError> {
        self.state.lock().await.store.read_block(index, begin, length)
    }

    /// Verifies and stores a received piece.
    ///
    /// Accepted pieces are broadcast to every connection. The submission that
    /// completes the store exports the content and announces `completed`.
    pub async fn submit_piece(&self, piece: Piece) -> Result<Acceptance, StoreError> {
        let state = self.state.lock().await;
        self.accept(state, piece).await
    }

    /// Files one block received from `peer`.
    ///
    /// Returns `None` while the piece is still missing blocks, and the outcome
    /// of [`submit_piece`](Self::submit_piece) once the last one is in.
    pub async fn submit_block(
        &self,
        peer: &PeerId,
        request: BlockRequest,
        block: Bytes,
    ) -> Result<Option<Acceptance>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(data) = state.take_block(peer, request.index, request.begin, block) else {
            return Ok(None);
        };
        let piece = match self.content.expected_hash(request.index) {
            Some(hash) => Piece::with_hash(request.index, data, *hash),
            None => Piece::new(request.index, data),
        };
        self.accept(state, piece).await.map(Some)
    }

    /// Exports and announces a download that held every piece from the start,
    /// which only happens for empty content. Does nothing otherwise.
    pub async fn finish_if_complete(&self) {
        let Some(path) = &self.export_path else {
            return;
        };
        let mut state = self.state.lock().await;
        if !state.claim_completion() {
            return;
        }
        let exported = state.store.export(path).await.map(|()| Some(path.clone()));
        drop(state);
        self.finish(exported).await;
    }

    async fn accept(
        &self,
        mut state: MutexGuard<'_, SwarmState>,
        piece: Piece,
    ) -> Result<Acceptance, StoreError> {
        let index = piece.index();
        let length = piece.len();
        let acceptance = state.accept_piece(piece)?;
        match acceptance {
            Acceptance::HashMismatch => {
                warn!("piece {} failed verification, discarded", index);
                return Ok(acceptance);
            }
            Acceptance::Duplicate => {
                debug!("piece {} already held", index);
                return Ok(acceptance);
            }
            Acceptance::Stored | Acceptance::Completed => {}
        }

        self.downloaded.fetch_add(length, Ordering::Relaxed);
        debug!(
            "stored piece {} ({}/{})",
            index,
            state.store.held_count(),
            state.store.total_pieces()
        );
        let _ = self.haves.send(index);

        if acceptance == Acceptance::Completed {
            let exported = match &self.export_path {
                Some(path) => state.store.export(path).await.map(|()| Some(path.clone())),
                None => Ok(None),
            };
            drop(state);
            self.finish(exported).await;
        }
        Ok(acceptance)
    }

    pub fn record_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Indices of pieces accepted from now on.
    pub fn subscribe_haves(&self) -> broadcast::Receiver<u32> {
        self.haves.subscribe()
    }

    pub fn completion(&self) -> watch::Receiver<Completion> {
        self.completion.subscribe()
    }

    pub async fn progress(&self) -> Progress {
        let left = self.state.lock().await.store.bytes_left();
        Progress {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left,
        }
    }

    pub async fn stats(&self) -> SwarmStats {
        let state = self.state.lock().await;
        SwarmStats {
            held_pieces: state.store.held_count(),
            total_pieces: state.store.total_pieces(),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            connected_peers: state.active_peers(),
        }
    }

    async fn finish(&self, exported: Result<Option<PathBuf>, StoreError>) {
        let path = match exported {
            Ok(path) => path,
            Err(e) => {
                error!("download of {} complete but export failed: {}", self.content.name, e);
                self.completion.send_replace(Completion::Failed(e.to_string()));
                return;
            }
        };
        match &path {
            Some(path) => info!("download complete, exported to {}", path.display()),
            None => info!("download complete"),
        }

        let progress = Progress {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: 0,
        };
        if let Err(e) = self.announcer.announce(TrackerEvent::Completed, progress).await {
            warn!("completed announce failed: {}", e);
        }
        self.completion.send_replace(Completion::Complete(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracker::StaticTracker;

    const DATA: &[u8] = b"0123456789";

    fn piece(index: u32) -> Piece {
        let start = index as usize * 4;
        let end = (start + 4).min(DATA.len());
        Piece::new(index, Bytes::copy_from_slice(&DATA[start..end]))
    }

    fn coordinator(
        tracker: Arc<StaticTracker>,
        export_path: Option<PathBuf>,
    ) -> SwarmCoordinator {
        let content = ContentInfo::new([7; 20], "data.bin", DATA.len() as u64, 4);
        let store = PieceStore::for_content(&content).unwrap();
        let announcer = Arc::new(Announcer::new(tracker, content.content_id, [1; 20], None));
        SwarmCoordinator::new(content, store, [1; 20], announcer, export_path)
    }

    #[tokio::test]
    async fn test_completion_exports_and_announces_once() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("nested").join("data.bin");
        let tracker = Arc::new(StaticTracker::new(vec![]));
        let coordinator = coordinator(tracker.clone(), Some(out.clone()));
        let completion = coordinator.completion();
        assert_eq!(*completion.borrow(), Completion::InProgress);

        assert_eq!(coordinator.submit_piece(piece(2)).await.unwrap(), Acceptance::Stored);
        assert_eq!(coordinator.submit_piece(piece(0)).await.unwrap(), Acceptance::Stored);
        assert_eq!(
            coordinator.submit_piece(piece(1)).await.unwrap(),
            Acceptance::Completed
        );
        assert_eq!(
            coordinator.submit_piece(piece(1)).await.unwrap(),
            Acceptance::Duplicate
        );

        assert_eq!(*completion.borrow(), Completion::Complete(Some(out.clone())));
        assert_eq!(tokio::fs::read(&out).await.unwrap(), DATA);
        assert_eq!(tracker.events(), vec![TrackerEvent::Completed]);

        let stats = coordinator.stats().await;
        assert_eq!(stats.held_pieces, 3);
        assert_eq!(stats.downloaded, DATA.len() as u64);
    }

    #[tokio::test]
    async fn test_hash_mismatch_changes_nothing() {
        let coordinator = coordinator(Arc::new(StaticTracker::new(vec![])), None);
        let corrupt = Piece::with_hash(0, Bytes::from_static(b"XXXX"), piece(0).hash().to_owned());

        assert_eq!(
            coordinator.submit_piece(corrupt).await.unwrap(),
            Acceptance::HashMismatch
        );
        let stats = coordinator.stats().await;
        assert_eq!(stats.held_pieces, 0);
        assert_eq!(stats.downloaded, 0);
    }

    #[tokio::test]
    async fn test_accepted_pieces_are_broadcast() {
        let coordinator = coordinator(Arc::new(StaticTracker::new(vec![])), None);
        let mut haves = coordinator.subscribe_haves();

        coordinator.submit_piece(piece(1)).await.unwrap();
        assert_eq!(haves.recv().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_export_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        let tracker = Arc::new(StaticTracker::new(vec![]));
        let coordinator = coordinator(tracker.clone(), Some(blocker.join("data.bin")));

        for i in 0..3 {
            coordinator.submit_piece(piece(i)).await.unwrap();
        }
        assert!(matches!(
            *coordinator.completion().borrow(),
            Completion::Failed(_)
        ));
        assert!(tracker.events().is_empty());
    }

    #[tokio::test]
    async fn test_blocks_assemble_into_piece() {
        let coordinator = coordinator(Arc::new(StaticTracker::new(vec![])), None);
        coordinator.report_bitfield([2; 20], &[0b1110_0000]).await;
        let request = coordinator.next_block_request(&[2; 20]).await.unwrap();
        assert_eq!(request, BlockRequest { index: 0, begin: 0, length: 4 });

        // Another peer cannot complete a piece it was never asked for.
        assert_eq!(
            coordinator
                .submit_block(&[3; 20], request, piece(0).data().clone())
                .await
                .unwrap(),
            None
        );
        assert_eq!(
            coordinator
                .submit_block(&[2; 20], request, piece(0).data().clone())
                .await
                .unwrap(),
            Some(Acceptance::Stored)
        );
        assert_eq!(coordinator.stats().await.held_pieces, 1);
    }

    #[tokio::test]
    async fn test_empty_download_exports_once() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("empty.bin");
        let tracker = Arc::new(StaticTracker::new(vec![]));
        let content = ContentInfo::new([7; 20], "empty.bin", 0, 4);
        let store = PieceStore::for_content(&content).unwrap();
        let announcer = Arc::new(Announcer::new(tracker.clone(), content.content_id, [1; 20], None));
        let coordinator = SwarmCoordinator::new(content, store, [1; 20], announcer, Some(out.clone()));
        assert_eq!(*coordinator.completion().borrow(), Completion::InProgress);

        coordinator.finish_if_complete().await;
        coordinator.finish_if_complete().await;
        assert_eq!(
            *coordinator.completion().borrow(),
            Completion::Complete(Some(out.clone()))
        );
        assert!(tokio::fs::read(&out).await.unwrap().is_empty());
        assert_eq!(tracker.events(), vec![TrackerEvent::Completed]);
    }

    #[tokio::test]
    async fn test_register_rejects_self_and_duplicates() {
        let coordinator = coordinator(Arc::new(StaticTracker::new(vec![])), None);
        assert!(!coordinator.register_peer([1; 20]).await);
        assert!(coordinator.register_peer([2; 20]).await);
        assert!(!coordinator.register_peer([2; 20]).await);

        coordinator.peer_disconnected(&[2; 20]).await;
        assert!(coordinator.register_peer([2; 20]).await);
    }

    #[tokio::test]
    async fn test_requests_follow_peer_bitfield() {
        let coordinator = coordinator(Arc::new(StaticTracker::new(vec![])), None);
        // Peer 2 advertises pieces 0 and 2; the payload is padded to one byte.
        assert!(coordinator.report_bitfield([2; 20], &[0b1010_0000]).await);
        coordinator.report_have([3; 20], 0).await;

        assert_eq!(coordinator.select_rarest().await, Some(2));
        let request = coordinator.next_block_request(&[2; 20]).await.unwrap();
        assert_eq!(request, BlockRequest { index: 2, begin: 0, length: 2 });

        coordinator.release_requests(&[2; 20]).await;
        assert_eq!(coordinator.next_block_request(&[2; 20]).await.unwrap().index, 2);
    }
}
