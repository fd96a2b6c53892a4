use crate::config::{DEFAULT_PIECE_LENGTH, SessionConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use swarm_core::ContentId;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to accept peer connections on
    #[arg(short, long, global = true, default_value = "0.0.0.0:6881")]
    pub listen: SocketAddr,

    /// Upload cap in bytes per second (0 = unlimited)
    #[arg(long, global = true, default_value_t = 0)]
    pub upload_limit: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Seed a local file until interrupted
    Share {
        /// File to share
        file: PathBuf,

        /// Piece length in bytes
        #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
        piece_length: u64,
    },

    /// Fetch content from one or more peers
    Download {
        /// Content id as 40 hex characters
        #[arg(long, value_parser = parse_content_id)]
        content_id: ContentId,

        /// Total content length in bytes
        #[arg(long)]
        length: u64,

        /// Piece length in bytes
        #[arg(long, default_value_t = DEFAULT_PIECE_LENGTH)]
        piece_length: u64,

        /// File name to export as
        #[arg(long)]
        name: String,

        /// Peer address to connect to (repeatable)
        #[arg(long = "peer", required = true)]
        peers: Vec<SocketAddr>,

        /// Output directory for the downloaded file
        #[arg(short, long, default_value = "downloads")]
        output: PathBuf,
    },
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default()
            .with_listen_addr(self.listen)
            .with_upload_rate_limit(self.upload_limit);
        match &self.command {
            Command::Share { piece_length, .. } => {
                config = config.with_piece_length(*piece_length);
            }
            Command::Download {
                piece_length,
                output,
                ..
            } => {
                config = config
                    .with_piece_length(*piece_length)
                    .with_output_dir(output);
            }
        }
        config
    }
}

fn parse_content_id(s: &str) -> Result<ContentId, String> {
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected 20 bytes, got {}", b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download() {
        let id = "ab".repeat(20);
        let args = Args::try_parse_from([
            "client",
            "download",
            "--content-id",
            &id,
            "--length",
            "20000",
            "--name",
            "file.bin",
            "--peer",
            "127.0.0.1:7000",
            "--peer",
            "127.0.0.1:7001",
            "--listen",
            "127.0.0.1:0",
        ])
        .unwrap();

        let config = args.session_config();
        assert_eq!(config.listen_addr, "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.output_dir, PathBuf::from("downloads"));
        assert_eq!(config.piece_length, 8192);
        match args.command {
            Command::Download {
                content_id,
                length,
                peers,
                ..
            } => {
                assert_eq!(content_id, [0xab; 20]);
                assert_eq!(length, 20000);
                assert_eq!(peers.len(), 2);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_share() {
        let args =
            Args::try_parse_from(["client", "share", "notes.txt", "--piece-length", "4096"]).unwrap();
        assert!(matches!(args.command, Command::Share { .. }));
        assert_eq!(args.session_config().piece_length, 4096);
    }

    #[test]
    fn test_bad_content_id() {
        assert!(parse_content_id("abcd").is_err());
        assert!(parse_content_id("zz").is_err());
        assert!(
            Args::try_parse_from(["client", "download", "--length", "1", "--name", "x"]).is_err()
        );
    }
}
