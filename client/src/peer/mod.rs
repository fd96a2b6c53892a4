//! One TCP connection to one remote peer.
//!
//! Each connection runs as its own task: it performs the handshake, then
//! reacts to incoming frames and to pieces the rest of the session accepts.
//! Frames are read by a separate receive task so the state machine can wait
//! on several event sources at once without losing a partially read frame.

mod handler;

pub use handler::serve;

use crate::config::SessionConfig;
use crate::error::PeerError;
use crate::swarm::{BlockRequest, SwarmCoordinator};
use bytes::Bytes;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use swarm_core::wire::{HANDSHAKE_LEN, Handshake, LENGTH_PREFIX_LEN, Message, frame_length};
use swarm_core::{Bitfield, ContentId, PeerId, TokenBucket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast};

/// Lifecycle of a connection. Inbound connections start at `Accepted`,
/// outbound ones at `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Per-connection protocol state, owned by the connection's task.
#[derive(Debug)]
pub struct ConnectionState {
    pub remote_addr: SocketAddr,
    pub remote_peer_id: Option<PeerId>,
    pub state: ConnState,
    /// We refuse to upload to the peer.
    pub am_choking: bool,
    /// We want pieces the peer has.
    pub am_interested: bool,
    /// The peer refuses to upload to us.
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub remote_bitfield: Option<Bitfield>,
    /// Requests sent and not yet answered.
    pub in_flight: HashSet<BlockRequest>,
    pub hash_failures: u32,
}

impl ConnectionState {
    fn new(remote_addr: SocketAddr, state: ConnState) -> Self {
        Self {
            remote_addr,
            remote_peer_id: None,
            state,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote_bitfield: None,
            in_flight: HashSet::new(),
            hash_failures: 0,
        }
    }

    pub fn inbound(remote_addr: SocketAddr) -> Self {
        Self::new(remote_addr, ConnState::Accepted)
    }

    pub fn outbound(remote_addr: SocketAddr) -> Self {
        Self::new(remote_addr, ConnState::Connecting)
    }

    pub fn is_running(&self) -> bool {
        self.state != ConnState::Closed
    }
}

/// What every connection of a session shares.
#[derive(Clone)]
pub struct PeerContext {
    pub coordinator: Arc<SwarmCoordinator>,
    pub config: Arc<SessionConfig>,
    /// Present when uploads are throttled.
    pub upload_limiter: Option<Arc<Mutex<TokenBucket>>>,
    /// Set once the session starts shutting down.
    pub stopping: Arc<AtomicBool>,
    pub shutdown: broadcast::Sender<()>,
}

/// Builds a 20-byte peer id: `prefix` followed by random alphanumerics.
pub fn generate_peer_id(prefix: &str) -> PeerId {
    let mut id = [0u8; 20];
    let prefix = prefix.as_bytes();
    let n = prefix.len().min(id.len());
    id[..n].copy_from_slice(&prefix[..n]);

    let mut rng = rand::rng();
    for byte in id[n..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

/// Sends our handshake, then reads and checks the peer's.
///
/// Returns the remote peer id. A wrong protocol string or content id is an
/// error and the caller must drop the stream without further I/O.
pub async fn exchange_handshake<S>(
    stream: &mut S,
    content_id: &ContentId,
    local_id: &PeerId,
) -> Result<PeerId, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&Handshake::new(*content_id, *local_id).encode())
        .await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    let remote = Handshake::decode_for(&buf, content_id)?;
    Ok(remote.peer_id)
}

/// Reads one complete frame. A keep-alive comes back as `Message::KeepAlive`.
pub async fn read_frame<R>(reader: &mut R, max_frame_length: u32) -> Result<Message, PeerError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut prefix).await.map_err(closed_on_eof)?;
    let len = frame_length(prefix, max_frame_length)?;

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(closed_on_eof)?;
    Ok(Message::decode(Bytes::from(body))?)
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    Ok(())
}

fn closed_on_eof(e: std::io::Error) -> PeerError {
    if e.kind() == ErrorKind::UnexpectedEof {
        PeerError::ConnectionClosed
    } else {
        PeerError::Io(e)
    }
}
