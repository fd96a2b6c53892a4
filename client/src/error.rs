//! Error types for the client.
//!
//! Each layer has its own enum so a failure stays scoped to what caused it: a
//! `PeerError` ends one connection, a `StoreError` fails one share or export,
//! and a `SessionError` is what the session surfaces to its caller.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use swarm_core::wire::WireError;
use thiserror::Error;
use tracker::TrackerError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("piece {0} not found")]
    NotFound(u32),

    #[error("piece index {index} out of range (total {total})")]
    InvalidIndex { index: u32, total: usize },

    #[error("piece {index} has {actual} bytes, expected {expected}")]
    LengthMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("block {begin}+{length} is outside piece {index}")]
    InvalidBlock { index: u32, begin: u32, length: u32 },

    #[error("store incomplete: {held}/{total} pieces")]
    Incomplete { held: usize, total: usize },

    #[error("piece length must be greater than zero")]
    InvalidPieceLength,

    #[error("piece length {length} exceeds the maximum of {max}")]
    PieceLengthTooLarge { length: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    /// The remote peer id already has an active connection, or is our own.
    #[error("duplicate peer connection")]
    DuplicatePeer,

    #[error("peer sent {0} corrupt pieces")]
    TooManyHashFailures(u32),

    #[error("session shutting down")]
    Shutdown,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: PeerError,
    },

    #[error("session already started")]
    AlreadyStarted,

    #[error("session not started")]
    NotStarted,

    #[error("download failed: {0}")]
    DownloadFailed(String),
}
