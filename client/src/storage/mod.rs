//! Piece store: the pieces held for one content item.
//!
//! The store is either filled in one go by splitting a source file (sharing)
//! or starts empty and is filled piece by piece from the network
//! (downloading). Once complete it can be exported back into a single file.

mod piece;

pub use piece::{Piece, sha256};

use crate::error::StoreError;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use swarm_core::{Bitfield, ContentInfo};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Longest piece a store accepts. Each piece is held in memory whole.
pub const MAX_PIECE_LENGTH: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct PieceStore {
    piece_length: u64,
    total_length: u64,
    total_pieces: usize,
    /// Only held pieces are present; iteration order is index order.
    pieces: BTreeMap<u32, Piece>,
}

impl PieceStore {
    /// Creates an empty store for content of `total_length` bytes.
    pub fn new(total_length: u64, piece_length: u64) -> Result<Self, StoreError> {
        check_piece_length(piece_length)?;
        Ok(Self {
            piece_length,
            total_length,
            total_pieces: total_length.div_ceil(piece_length) as usize,
            pieces: BTreeMap::new(),
        })
    }

    pub fn for_content(content: &ContentInfo) -> Result<Self, StoreError> {
        Self::new(content.total_length, content.piece_length)
    }

    /// Builds a full store by reading `source` in `piece_length` windows.
    ///
    /// The final window may be shorter; it is never padded. An empty file
    /// yields a store with zero pieces.
    pub async fn split(source: impl AsRef<Path>, piece_length: u64) -> Result<Self, StoreError> {
        check_piece_length(piece_length)?;
        let source = source.as_ref();
        let mut file = File::open(source).await.map_err(|e| StoreError::Open {
            path: source.to_path_buf(),
            source: e,
        })?;

        let mut pieces = BTreeMap::new();
        let mut total_length = 0u64;
        let mut index = 0u32;
        loop {
            let mut window = vec![0u8; piece_length as usize];
            let filled = read_window(&mut file, &mut window).await?;
            if filled == 0 {
                break;
            }
            window.truncate(filled);
            total_length += filled as u64;
            pieces.insert(index, Piece::new(index, Bytes::from(window)));
            index += 1;
            if (filled as u64) < piece_length {
                break;
            }
        }

        info!(
            "Split {} into {} pieces ({} bytes)",
            source.display(),
            pieces.len(),
            total_length
        );
        Ok(Self {
            piece_length,
            total_length,
            total_pieces: pieces.len(),
            pieces,
        })
    }

    /// Inserts `piece` unless its index is already held.
    ///
    /// Returns `Ok(false)` for a duplicate, leaving the stored piece untouched.
    /// The digest is not re-checked here; callers verify before submitting.
    pub fn add_piece(&mut self, piece: Piece) -> Result<bool, StoreError> {
        let index = piece.index();
        if self.pieces.contains_key(&index) {
            return Ok(false);
        }
        let expected = self.get_exact_length(index)?;
        if piece.len() != expected {
            return Err(StoreError::LengthMismatch {
                index,
                expected,
                actual: piece.len(),
            });
        }
        self.pieces.insert(index, piece);
        Ok(true)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces.contains_key(&index)
    }

    pub fn get_piece(&self, index: u32) -> Result<&Piece, StoreError> {
        self.pieces.get(&index).ok_or(StoreError::NotFound(index))
    }

    /// True byte length of piece `index`, accounting for a short final piece.
    pub fn get_exact_length(&self, index: u32) -> Result<u64, StoreError> {
        let i = index as usize;
        if i >= self.total_pieces {
            return Err(StoreError::InvalidIndex {
                index,
                total: self.total_pieces,
            });
        }
        if i == self.total_pieces - 1 {
            Ok(self.total_length - (self.total_pieces as u64 - 1) * self.piece_length)
        } else {
            Ok(self.piece_length)
        }
    }

    /// Copies `length` bytes starting at `begin` out of a held piece.
    pub fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StoreError> {
        let piece = self.get_piece(index)?;
        let start = begin as usize;
        let end = start + length as usize;
        if end > piece.data().len() {
            return Err(StoreError::InvalidBlock {
                index,
                begin,
                length,
            });
        }
        Ok(piece.data().slice(start..end))
    }

    /// The availability bitfield; cost is proportional to held pieces.
    pub fn bitfield(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.total_pieces);
        for &index in self.pieces.keys() {
            bitfield.set(index as usize);
        }
        bitfield
    }

    /// True if `remote` has at least one piece this store lacks.
    pub fn is_interesting(&self, remote: &Bitfield) -> bool {
        remote.iter_set().any(|i| !self.has_piece(i as u32))
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.len() == self.total_pieces
    }

    pub fn held_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn total_pieces(&self) -> usize {
        self.total_pieces
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Bytes still missing, for tracker `left`.
    pub fn bytes_left(&self) -> u64 {
        let held: u64 = self.pieces.values().map(Piece::len).sum();
        self.total_length - held
    }

    /// Digests of all pieces in index order, or `None` while incomplete.
    pub fn piece_hashes(&self) -> Option<Vec<swarm_core::Sha256Digest>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.pieces.values().map(|p| *p.hash()).collect())
    }

    /// Writes every piece, in index order, to `destination`.
    ///
    /// Missing parent directories are created. Fails with
    /// [`StoreError::Incomplete`] unless all pieces are held.
    pub async fn export(&self, destination: impl AsRef<Path>) -> Result<(), StoreError> {
        if !self.is_complete() {
            return Err(StoreError::Incomplete {
                held: self.pieces.len(),
                total: self.total_pieces,
            });
        }

        let destination = destination.as_ref();
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let mut file = File::create(destination).await?;
        for piece in self.pieces.values() {
            file.write_all(piece.data()).await?;
        }
        file.flush().await?;

        debug!(
            "Exported {} bytes to {}",
            self.total_length,
            destination.display()
        );
        Ok(())
    }
}

fn check_piece_length(piece_length: u64) -> Result<(), StoreError> {
    if piece_length == 0 {
        return Err(StoreError::InvalidPieceLength);
    }
    if piece_length > MAX_PIECE_LENGTH {
        return Err(StoreError::PieceLengthTooLarge {
            length: piece_length,
            max: MAX_PIECE_LENGTH,
        });
    }
    Ok(())
}

async fn read_window(file: &mut File, window: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < window.len() {
        let n = file.read(&mut window[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
