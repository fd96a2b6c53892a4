//! The resolved description of one shared content item.

use crate::ContentId;
use sha1::{Digest, Sha1};

/// SHA-256 digest of one piece.
pub type Sha256Digest = [u8; 32];

/// Everything a session needs to know about the content it distributes.
///
/// Decoding torrent descriptors or magnet links happens elsewhere; by the time
/// a `ContentInfo` exists, the identifier and lengths are already known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    /// Identifier exchanged in the handshake.
    pub content_id: ContentId,
    /// Name used for the exported file.
    pub name: String,
    pub total_length: u64,
    pub piece_length: u64,
    /// Expected digest of every piece, when the descriptor carries them.
    pub piece_hashes: Option<Vec<Sha256Digest>>,
}

impl ContentInfo {
    pub fn new(content_id: ContentId, name: &str, total_length: u64, piece_length: u64) -> Self {
        Self {
            content_id,
            name: name.to_string(),
            total_length,
            piece_length,
            piece_hashes: None,
        }
    }

    /// Describes content whose pieces are already hashed, deriving the
    /// identifier from the name, the lengths and the ordered piece digests.
    pub fn for_pieces(
        name: &str,
        total_length: u64,
        piece_length: u64,
        piece_hashes: Vec<Sha256Digest>,
    ) -> Self {
        let mut hasher = Sha1::new();
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update(total_length.to_be_bytes());
        hasher.update(piece_length.to_be_bytes());
        for digest in &piece_hashes {
            hasher.update(digest);
        }
        let mut content_id = [0u8; 20];
        content_id.copy_from_slice(&hasher.finalize());

        Self {
            content_id,
            name: name.to_string(),
            total_length,
            piece_length,
            piece_hashes: Some(piece_hashes),
        }
    }

    pub fn with_piece_hashes(mut self, piece_hashes: Vec<Sha256Digest>) -> Self {
        self.piece_hashes = Some(piece_hashes);
        self
    }

    /// `ceil(total_length / piece_length)`, zero for an empty item.
    pub fn total_pieces(&self) -> usize {
        if self.piece_length == 0 {
            return 0;
        }
        self.total_length.div_ceil(self.piece_length) as usize
    }

    pub fn expected_hash(&self, index: u32) -> Option<&Sha256Digest> {
        self.piece_hashes.as_ref()?.get(index as usize)
    }

    pub fn hex_id(&self) -> String {
        hex::encode(self.content_id)
    }
}
