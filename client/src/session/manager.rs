use super::{Running, Session};
use crate::error::{PeerError, SessionError};
use crate::peer::{self, ConnectionState, PeerContext};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use swarm_core::TokenBucket;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracker::TrackerEvent;

type Connections = Arc<Mutex<Vec<JoinHandle<()>>>>;

pub async fn start(session: &mut Session) -> Result<(), SessionError> {
    if session.running.is_some() {
        return Err(SessionError::AlreadyStarted);
    }

    let listener = TcpListener::bind(session.config.listen_addr).await?;
    let local_addr = listener.local_addr()?;
    session.announcer.set_port(local_addr.port());
    info!("listening on {}", local_addr);

    let (shutdown, _) = broadcast::channel(1);
    let upload_limiter = (session.config.upload_rate_limit > 0).then(|| {
        Arc::new(Mutex::new(TokenBucket::per_second(
            session.config.upload_rate_limit,
        )))
    });
    let ctx = PeerContext {
        coordinator: session.coordinator.clone(),
        config: session.config.clone(),
        upload_limiter,
        stopping: Arc::new(AtomicBool::new(false)),
        shutdown,
    };
    let connections: Connections = Arc::new(Mutex::new(Vec::new()));

    let listener = tokio::spawn(accept_loop(
        listener,
        ctx.clone(),
        connections.clone(),
        ctx.shutdown.subscribe(),
    ));
    session.running = Some(Running {
        local_addr,
        ctx: ctx.clone(),
        listener,
        connections: connections.clone(),
    });

    let progress = session.coordinator.progress().await;
    let announced = session
        .announcer
        .announce(TrackerEvent::Started, progress)
        .await;
    session.coordinator.finish_if_complete().await;
    let response = match announced {
        Ok(response) => response,
        Err(e) => {
            warn!("started announce failed: {}", e);
            return Ok(());
        }
    };
    info!("tracker returned {} peers", response.peers.len());

    for peer in response.peers {
        if peer.peer_id.as_ref() == Some(&session.peer_id) || peer.addr == local_addr {
            continue;
        }
        if let Err(e) = dial(peer.addr, &ctx, &connections).await {
            info!("could not connect to {}: {}", peer.addr, e);
        }
    }
    Ok(())
}

pub async fn connect(session: &Session, addr: SocketAddr) -> Result<(), SessionError> {
    let running = session.running.as_ref().ok_or(SessionError::NotStarted)?;
    dial(addr, &running.ctx, &running.connections)
        .await
        .map_err(|source| SessionError::Connect { addr, source })
}

pub async fn stop(session: &mut Session) -> Result<(), SessionError> {
    let running = session.running.take().ok_or(SessionError::NotStarted)?;
    info!("stopping session");

    running.ctx.stopping.store(true, Ordering::SeqCst);
    let _ = running.ctx.shutdown.send(());
    if let Err(e) = running.listener.await {
        warn!("listener task failed: {}", e);
    }

    let handles = std::mem::take(&mut *running.connections.lock().await);
    debug!("waiting for {} connection tasks", handles.len());
    for mut handle in handles {
        let joined = match timeout(session.config.shutdown_grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("connection task did not stop in time, aborting");
                handle.abort();
                handle.await
            }
        };
        match joined {
            Err(e) if !e.is_cancelled() => warn!("connection task failed: {}", e),
            _ => {}
        }
    }

    let progress = session.coordinator.progress().await;
    if let Err(e) = session
        .announcer
        .announce(TrackerEvent::Stopped, progress)
        .await
    {
        warn!("stopped announce failed: {}", e);
    }
    info!("session stopped");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    ctx: PeerContext,
    connections: Connections,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    spawn_connection(stream, ConnectionState::inbound(addr), &ctx, &connections).await;
                }
                Err(e) => warn!("accept failed: {}", e),
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!("listener closed");
}

/// Opens an outbound connection and hands it to its own task.
async fn dial(addr: SocketAddr, ctx: &PeerContext, connections: &Connections) -> Result<(), PeerError> {
    let conn = ConnectionState::outbound(addr);
    let stream = timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| PeerError::Timeout)??;
    debug!("connected to {}", addr);
    spawn_connection(stream, conn, ctx, connections).await;
    Ok(())
}

async fn spawn_connection(
    stream: TcpStream,
    conn: ConnectionState,
    ctx: &PeerContext,
    connections: &Connections,
) {
    let shutdown = ctx.shutdown.subscribe();
    let ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let addr = conn.remote_addr;
        match peer::serve(stream, conn, ctx, shutdown).await {
            Ok(()) | Err(PeerError::Shutdown) => {}
            Err(e) => debug!("{}: connection ended: {}", addr, e),
        }
    });

    let mut handles = connections.lock().await;
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
}
