use super::Session;
use crate::announce::Announcer;
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::peer::generate_peer_id;
use crate::storage::PieceStore;
use crate::swarm::SwarmCoordinator;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use swarm_core::ContentInfo;
use tracing::info;
use tracker::TrackerClient;

/// Builds a seeding session from a file on disk.
///
/// The content id is derived from the file name, the lengths and the piece
/// digests, so two sessions sharing the same bytes under the same name agree
/// on it.
pub async fn share(
    source: &Path,
    config: SessionConfig,
    tracker: Arc<dyn TrackerClient>,
) -> Result<Session, SessionError> {
    let store = PieceStore::split(source, config.piece_length).await?;
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "content".to_string());
    let hashes = store.piece_hashes().unwrap_or_default();
    let content = ContentInfo::for_pieces(&name, store.total_length(), store.piece_length(), hashes);
    info!(
        "sharing {} ({} bytes, {} pieces), content id {}",
        name,
        content.total_length,
        store.total_pieces(),
        content.hex_id()
    );
    Ok(assemble(content, store, config, tracker, false))
}

/// Builds a downloading session with an empty store.
pub fn download(
    content: ContentInfo,
    config: SessionConfig,
    tracker: Arc<dyn TrackerClient>,
) -> Result<Session, SessionError> {
    let store = PieceStore::for_content(&content)?;
    info!(
        "downloading {} ({} bytes, {} pieces), content id {}",
        content.name,
        content.total_length,
        store.total_pieces(),
        content.hex_id()
    );
    Ok(assemble(content, store, config, tracker, true))
}

fn assemble(
    content: ContentInfo,
    store: PieceStore,
    config: SessionConfig,
    tracker: Arc<dyn TrackerClient>,
    export: bool,
) -> Session {
    let peer_id = generate_peer_id(&config.peer_id_prefix);
    let announcer = Arc::new(Announcer::new(
        tracker,
        content.content_id,
        peer_id,
        advertised_ip(&config),
    ));
    let export_path = export.then(|| config.output_dir.join(&content.name));
    let coordinator = Arc::new(SwarmCoordinator::new(
        content,
        store,
        peer_id,
        announcer.clone(),
        export_path,
    ));

    Session {
        config: Arc::new(config),
        peer_id,
        coordinator,
        announcer,
        running: None,
    }
}

/// The configured announce address, else the listen address when it is a
/// concrete one.
fn advertised_ip(config: &SessionConfig) -> Option<IpAddr> {
    config.announce_ip.or_else(|| {
        let ip = config.listen_addr.ip();
        (!ip.is_unspecified()).then_some(ip)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::tempdir;
    use tracker::StaticTracker;

    #[tokio::test]
    async fn test_share_derives_same_id_for_same_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, vec![3u8; 9000]).await.unwrap();
        let tracker: Arc<dyn TrackerClient> = Arc::new(StaticTracker::new(vec![]));

        let a = share(&path, SessionConfig::loopback(), tracker.clone()).await.unwrap();
        let b = share(&path, SessionConfig::loopback(), tracker).await.unwrap();
        assert_eq!(a.content().content_id, b.content().content_id);
        assert_eq!(a.content().name, "notes.txt");
        assert_eq!(a.content().total_pieces(), 2);
        assert_ne!(a.peer_id(), b.peer_id());

        let stats = a.stats().await;
        assert_eq!((stats.held_pieces, stats.total_pieces), (2, 2));
        assert_eq!(a.wait_complete().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_share_missing_file() {
        let dir = tempdir().unwrap();
        let result = share(
            &dir.path().join("absent"),
            SessionConfig::loopback(),
            Arc::new(StaticTracker::new(vec![])),
        )
        .await;
        assert!(matches!(
            result,
            Err(SessionError::Store(StoreError::Open { .. }))
        ));
    }

    #[test]
    fn test_advertised_ip() {
        assert_eq!(advertised_ip(&SessionConfig::default()), None);
        assert_eq!(
            advertised_ip(&SessionConfig::loopback()),
            Some("127.0.0.1".parse().unwrap())
        );
    }
}
