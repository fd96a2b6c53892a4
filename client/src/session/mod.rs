mod init;
mod manager;

use crate::announce::Announcer;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::peer::PeerContext;
use crate::swarm::{Completion, SwarmCoordinator};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_core::{ContentInfo, PeerId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracker::{ScrapeStats, TrackerClient};

/// Snapshot of a session's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub held_pieces: usize,
    pub total_pieces: usize,
    pub downloaded: u64,
    pub uploaded: u64,
    pub connected_peers: usize,
}

/// Everything that only exists between `start` and `stop`.
struct Running {
    local_addr: SocketAddr,
    ctx: PeerContext,
    listener: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// One shared or downloaded content item.
///
/// Owns the piece store (through its coordinator), the listening socket and
/// every connection task. Nothing touches the store once `stop` returns.
pub struct Session {
    config: Arc<SessionConfig>,
    peer_id: PeerId,
    coordinator: Arc<SwarmCoordinator>,
    announcer: Arc<Announcer>,
    running: Option<Running>,
}

impl Session {
    /// Splits `source` into pieces and prepares to seed it.
    pub async fn share(
        source: impl AsRef<Path>,
        config: SessionConfig,
        tracker: Arc<dyn TrackerClient>,
    ) -> Result<Self, SessionError> {
        init::share(source.as_ref(), config, tracker).await
    }

    /// Prepares an empty store for `content`; the finished file is exported to
    /// `config.output_dir`.
    pub fn download(
        content: ContentInfo,
        config: SessionConfig,
        tracker: Arc<dyn TrackerClient>,
    ) -> Result<Self, SessionError> {
        init::download(content, config, tracker)
    }

    /// Binds the listener, announces `started` and dials the returned peers.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        manager::start(self).await
    }

    /// Dials one more peer.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), SessionError> {
        manager::connect(self, addr).await
    }

    /// Closes the listener and every connection, waits for their tasks, then
    /// announces `stopped`.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        manager::stop(self).await
    }

    /// Waits until every piece is held, returning the export path for
    /// downloads and `None` for content that was shared.
    pub async fn wait_complete(&self) -> Result<Option<PathBuf>, SessionError> {
        self.coordinator.finish_if_complete().await;
        let mut completion = self.coordinator.completion();
        loop {
            match &*completion.borrow_and_update() {
                Completion::Complete(path) => return Ok(path.clone()),
                Completion::Failed(reason) => {
                    return Err(SessionError::DownloadFailed(reason.clone()));
                }
                Completion::InProgress => {}
            }
            completion
                .changed()
                .await
                .map_err(|_| SessionError::DownloadFailed("session dropped".to_string()))?;
        }
    }

    pub async fn scrape(&self) -> Result<ScrapeStats, SessionError> {
        Ok(self.announcer.scrape().await?)
    }

    pub async fn stats(&self) -> SessionStats {
        let stats = self.coordinator.stats().await;
        SessionStats {
            held_pieces: stats.held_pieces,
            total_pieces: stats.total_pieces,
            downloaded: stats.downloaded,
            uploaded: stats.uploaded,
            connected_peers: stats.connected_peers,
        }
    }

    pub fn content(&self) -> &ContentInfo {
        self.coordinator.content()
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}
