use super::{ConnState, ConnectionState, PeerContext, exchange_handshake, read_frame, write_message};
use crate::error::PeerError;
use crate::swarm::{Acceptance, BlockRequest};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::time::Duration;
use swarm_core::{Bitfield, PeerId};
use swarm_core::wire::Message;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, info, trace, warn};

/// Drives one connection from handshake to close.
///
/// `shutdown` must be subscribed before the session's stop flag is checked,
/// which is why the caller hands it in.
pub async fn serve(
    mut stream: TcpStream,
    mut conn: ConnectionState,
    ctx: PeerContext,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), PeerError> {
    if ctx.stopping.load(Ordering::SeqCst) {
        return Err(PeerError::Shutdown);
    }

    conn.state = ConnState::Handshaking;
    let coordinator = ctx.coordinator.clone();
    let content_id = coordinator.content().content_id;
    let handshake = timeout(
        ctx.config.handshake_timeout,
        exchange_handshake(&mut stream, &content_id, coordinator.local_id()),
    );
    let remote_id = tokio::select! {
        result = handshake => result.map_err(|_| PeerError::Timeout)??,
        _ = shutdown.recv() => return Err(PeerError::Shutdown),
    };

    if !coordinator.register_peer(remote_id).await {
        debug!("{}: duplicate peer {}", conn.remote_addr, hex::encode(remote_id));
        return Err(PeerError::DuplicatePeer);
    }
    conn.remote_peer_id = Some(remote_id);
    conn.state = ConnState::Active;
    info!("{}: connected to peer {}", conn.remote_addr, hex::encode(remote_id));

    let (reader, writer) = stream.into_split();
    let (frame_tx, frames) = mpsc::channel(32);
    let receiver = tokio::spawn(receive_loop(
        reader,
        frame_tx,
        ctx.config.read_timeout,
        ctx.config.max_frame_length,
    ));

    let mut active = Active {
        conn,
        ctx: &ctx,
        peer_id: remote_id,
        writer,
        shutdown,
    };
    let result = active.run(frames).await;

    receiver.abort();
    active.conn.state = ConnState::Closed;
    coordinator.peer_disconnected(&remote_id).await;
    match &result {
        Ok(()) => debug!("{}: closed", active.conn.remote_addr),
        Err(e) => info!("{}: closed: {}", active.conn.remote_addr, e),
    }
    result
}

/// Reads frames until the peer goes quiet, closes, or misbehaves.
///
/// The last item sent is the error that ended the loop.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    frames: mpsc::Sender<Result<Message, PeerError>>,
    read_timeout: Duration,
    max_frame_length: u32,
) {
    loop {
        let frame = match timeout(read_timeout, read_frame(&mut reader, max_frame_length)).await {
            Ok(frame) => frame,
            Err(_) => Err(PeerError::Timeout),
        };
        let failed = frame.is_err();
        match frame {
            Ok(Message::KeepAlive) => {
                trace!("keep-alive");
                continue;
            }
            frame => {
                if frames.send(frame).await.is_err() || failed {
                    return;
                }
            }
        }
    }
}

struct Active<'a> {
    conn: ConnectionState,
    ctx: &'a PeerContext,
    peer_id: PeerId,
    writer: OwnedWriteHalf,
    shutdown: broadcast::Receiver<()>,
}

impl Active<'_> {
    async fn run(
        &mut self,
        mut frames: mpsc::Receiver<Result<Message, PeerError>>,
    ) -> Result<(), PeerError> {
        let mut haves = self.ctx.coordinator.subscribe_haves();
        let bitfield = self.ctx.coordinator.local_bitfield().await;
        self.send(Message::Bitfield(bitfield.to_bytes())).await?;

        let period = (self.ctx.config.read_timeout / 2).max(Duration::from_secs(1));
        let mut keep_alive = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(Ok(message)) => self.on_message(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(PeerError::ConnectionClosed),
                },
                have = haves.recv() => match have {
                    Ok(index) => self.on_local_have(index).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("{}: missed {} have announcements", self.conn.remote_addr, skipped);
                        self.resend_bitfield().await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = keep_alive.tick() => self.send(Message::KeepAlive).await?,
                _ = self.shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Writes one message. A peer that stops reading cannot hold the
    /// connection open past `write_timeout` or past shutdown.
    async fn send(&mut self, message: Message) -> Result<(), PeerError> {
        trace!("{}: -> {:?}", self.conn.remote_addr, message.id());
        let write = timeout(
            self.ctx.config.write_timeout,
            write_message(&mut self.writer, &message),
        );
        tokio::select! {
            result = write => result.map_err(|_| PeerError::Timeout)?,
            _ = self.shutdown.recv() => Err(PeerError::Shutdown),
        }
    }

    async fn on_message(&mut self, message: Message) -> Result<(), PeerError> {
        trace!("{}: <- {:?}", self.conn.remote_addr, message.id());
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.conn.peer_choking = true;
                self.conn.in_flight.clear();
                self.ctx.coordinator.release_requests(&self.peer_id).await;
            }
            Message::Unchoke => {
                self.conn.peer_choking = false;
                self.fill_requests().await?;
            }
            Message::Interested => {
                self.conn.peer_interested = true;
                if self.conn.am_choking {
                    self.conn.am_choking = false;
                    self.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                self.conn.peer_interested = false;
                if !self.conn.am_choking {
                    self.conn.am_choking = true;
                    self.send(Message::Choke).await?;
                }
            }
            Message::Have { index } => {
                if let Some(bitfield) = self.conn.remote_bitfield.as_mut() {
                    bitfield.set(index as usize);
                }
                let interesting = self.ctx.coordinator.report_have(self.peer_id, index).await;
                self.update_interest(interesting).await?;
            }
            Message::Bitfield(payload) => {
                let coordinator = &self.ctx.coordinator;
                self.conn.remote_bitfield = Some(Bitfield::from_bytes(
                    &payload,
                    coordinator.content().total_pieces(),
                ));
                let interesting = coordinator.report_bitfield(self.peer_id, &payload).await;
                self.update_interest(interesting).await?;
            }
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(index, begin, length).await?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_piece(index, begin, block).await?,
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                trace!(
                    "{}: cancel {}+{}@{} (already served)",
                    self.conn.remote_addr, begin, length, index
                );
            }
        }
        Ok(())
    }

    /// Sends `interested` the first time the peer has something we lack, and
    /// starts requesting if it already unchoked us.
    async fn update_interest(&mut self, interesting: bool) -> Result<(), PeerError> {
        if interesting && !self.conn.am_interested {
            self.conn.am_interested = true;
            self.send(Message::Interested).await?;
        }
        self.fill_requests().await
    }

    async fn fill_requests(&mut self) -> Result<(), PeerError> {
        if self.conn.peer_choking || !self.conn.am_interested {
            return Ok(());
        }
        while self.conn.in_flight.len() < self.ctx.config.max_in_flight_requests {
            let Some(request) = self.ctx.coordinator.next_block_request(&self.peer_id).await else {
                break;
            };
            self.conn.in_flight.insert(request);
            self.send(Message::Request {
                index: request.index,
                begin: request.begin,
                length: request.length,
            })
            .await?;
        }
        Ok(())
    }

    async fn on_piece(&mut self, index: u32, begin: u32, block: Bytes) -> Result<(), PeerError> {
        let request = BlockRequest {
            index,
            begin,
            length: block.len() as u32,
        };
        if !self.conn.in_flight.remove(&request) {
            debug!(
                "{}: unrequested block {}+{}@{}",
                self.conn.remote_addr, begin, request.length, index
            );
            return Ok(());
        }

        let submitted = self
            .ctx
            .coordinator
            .submit_block(&self.peer_id, request, block)
            .await;
        match submitted {
            Ok(Some(Acceptance::HashMismatch)) => {
                self.conn.hash_failures += 1;
                warn!(
                    "{}: corrupt piece {} ({} so far)",
                    self.conn.remote_addr, index, self.conn.hash_failures
                );
                if self.conn.hash_failures >= self.ctx.config.max_hash_failures {
                    return Err(PeerError::TooManyHashFailures(self.conn.hash_failures));
                }
            }
            Ok(_) => {}
            Err(e) => warn!("{}: rejected piece {}: {}", self.conn.remote_addr, index, e),
        }
        self.fill_requests().await
    }

    async fn on_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        if self.conn.am_choking {
            debug!("{}: request while choked, ignored", self.conn.remote_addr);
            return Ok(());
        }
        if length > self.ctx.config.max_request_length {
            warn!("{}: requested block too large: {}", self.conn.remote_addr, length);
            return Ok(());
        }
        let block = match self.ctx.coordinator.read_block(index, begin, length).await {
            Ok(block) => block,
            Err(e) => {
                debug!("{}: cannot serve request: {}", self.conn.remote_addr, e);
                return Ok(());
            }
        };

        if let Some(limiter) = &self.ctx.upload_limiter {
            loop {
                let wait = limiter.lock().await.try_take(u64::from(length));
                match wait {
                    Ok(()) => break,
                    Err(delay) => tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.recv() => return Err(PeerError::Shutdown),
                    },
                }
            }
        }

        self.send(Message::Piece {
            index,
            begin,
            block,
        })
        .await?;
        self.ctx.coordinator.record_upload(u64::from(length));
        Ok(())
    }

    /// A piece was accepted somewhere in the session.
    async fn on_local_have(&mut self, index: u32) -> Result<(), PeerError> {
        self.send(Message::Have { index }).await?;
        self.drop_interest_if_done().await
    }

    async fn resend_bitfield(&mut self) -> Result<(), PeerError> {
        let bitfield = self.ctx.coordinator.local_bitfield().await;
        for index in bitfield.iter_set() {
            self.send(Message::Have { index: index as u32 }).await?;
        }
        self.drop_interest_if_done().await
    }

    async fn drop_interest_if_done(&mut self) -> Result<(), PeerError> {
        if self.conn.am_interested && !self.ctx.coordinator.is_interesting(&self.peer_id).await {
            self.conn.am_interested = false;
            self.send(Message::NotInterested).await?;
        }
        Ok(())
    }
}
