use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Piece length used when sharing and no other value is given.
pub const DEFAULT_PIECE_LENGTH: u64 = 8192;

/// Largest block a peer may request from us.
pub const DEFAULT_MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Settings for one session, passed in at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address the listener binds to; port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Address advertised to the tracker, when it differs from the listener's.
    pub announce_ip: Option<IpAddr>,
    pub piece_length: u64,
    /// Directory the completed download is exported into.
    pub output_dir: PathBuf,
    /// First 8 bytes of the generated peer id.
    pub peer_id_prefix: String,
    /// Outstanding `request` messages per connection.
    pub max_in_flight_requests: usize,
    pub max_request_length: u32,
    /// Frames longer than this are a protocol error.
    pub max_frame_length: u32,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a connection may stay silent before it is closed.
    pub read_timeout: Duration,
    /// How long one message may take to write before the peer is dropped.
    pub write_timeout: Duration,
    /// How long `stop` waits for a connection task before aborting it.
    pub shutdown_grace: Duration,
    /// Corrupt pieces tolerated from one peer before disconnecting it.
    pub max_hash_failures: u32,
    /// Upload cap in bytes per second; 0 disables throttling.
    pub upload_rate_limit: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 6881),
            announce_ip: None,
            piece_length: DEFAULT_PIECE_LENGTH,
            output_dir: PathBuf::from("downloads"),
            peer_id_prefix: "-SW0001-".to_string(),
            max_in_flight_requests: 4,
            max_request_length: DEFAULT_MAX_REQUEST_LENGTH,
            max_frame_length: DEFAULT_MAX_REQUEST_LENGTH + 1024,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            max_hash_failures: 3,
            upload_rate_limit: 0,
        }
    }
}

impl SessionConfig {
    pub fn with_listen_addr(mut self, listen_addr: SocketAddr) -> Self {
        self.listen_addr = listen_addr;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_piece_length(mut self, piece_length: u64) -> Self {
        self.piece_length = piece_length;
        self
    }

    pub fn with_upload_rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.upload_rate_limit = bytes_per_sec;
        self
    }

    /// A config bound to an ephemeral loopback port, handy for local swarms.
    pub fn loopback() -> Self {
        Self::default().with_listen_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }
}
