use bytes::Bytes;
use sha2::{Digest, Sha256};
use swarm_core::Sha256Digest;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Sha256Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// One chunk of the content together with its digest.
///
/// Immutable once built. A piece made with [`Piece::new`] is valid by
/// construction; one made with [`Piece::with_hash`] carries a declared digest
/// that [`Piece::verify`] checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    index: u32,
    data: Bytes,
    hash: Sha256Digest,
}

impl Piece {
    pub fn new(index: u32, data: Bytes) -> Self {
        let hash = sha256(&data);
        Self { index, data, hash }
    }

    pub fn with_hash(index: u32, data: Bytes, hash: Sha256Digest) -> Self {
        Self { index, data, hash }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn hash(&self) -> &Sha256Digest {
        &self.hash
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True if the data hashes to the declared digest.
    pub fn verify(&self) -> bool {
        sha256(&self.data) == self.hash
    }
}
