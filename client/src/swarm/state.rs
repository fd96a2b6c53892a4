use crate::error::StoreError;
use crate::storage::{Piece, PieceStore};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use swarm_core::{Bitfield, PeerId};

/// Largest block requested from a peer; longer pieces are fetched in several.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// A block to ask a peer for: `length` bytes at offset `begin` of piece `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// What happened to a submitted piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    Stored,
    /// Stored, and it was the last missing piece.
    Completed,
    /// Already held; nothing changed.
    Duplicate,
    /// Data did not match the digest; discarded.
    HashMismatch,
}

/// A piece being fetched from one peer, block by block.
#[derive(Debug)]
struct PartialPiece {
    owner: PeerId,
    length: u32,
    /// Offset of the first byte not yet requested.
    next_begin: u32,
    blocks: BTreeMap<u32, Bytes>,
    received: u32,
}

impl PartialPiece {
    fn new(owner: PeerId, length: u32) -> Self {
        Self {
            owner,
            length,
            next_begin: 0,
            blocks: BTreeMap::new(),
            received: 0,
        }
    }
}

/// Cross-connection state, always accessed under the coordinator's lock.
#[derive(Debug)]
pub struct SwarmState {
    pub(crate) store: PieceStore,
    bitfields: HashMap<PeerId, Bitfield>,
    /// Number of tracked peers advertising each piece; zero counts are removed.
    piece_frequency: BTreeMap<u32, u32>,
    /// Pieces currently requested, keyed by index.
    reserved: HashMap<u32, PartialPiece>,
    active: HashSet<PeerId>,
    completed: bool,
}

impl SwarmState {
    pub fn new(store: PieceStore) -> Self {
        Self {
            store,
            bitfields: HashMap::new(),
            piece_frequency: BTreeMap::new(),
            reserved: HashMap::new(),
            active: HashSet::new(),
            completed: false,
        }
    }

    /// Marks `peer` as connected; false if it already is.
    pub fn register(&mut self, peer: PeerId) -> bool {
        self.active.insert(peer)
    }

    pub fn active_peers(&self) -> usize {
        self.active.len()
    }

    /// Replaces `peer`'s bitfield and returns whether it has pieces we lack.
    pub fn report_bitfield(&mut self, peer: PeerId, bitfield: Bitfield) -> bool {
        if let Some(old) = self.bitfields.remove(&peer) {
            self.forget(&old);
        }
        for index in bitfield.iter_set() {
            *self.piece_frequency.entry(index as u32).or_insert(0) += 1;
        }
        let interesting = self.store.is_interesting(&bitfield);
        self.bitfields.insert(peer, bitfield);
        interesting
    }

    /// Records that `peer` now has `index`; returns whether it has pieces we lack.
    ///
    /// Indices past the end of the content are ignored.
    pub fn report_have(&mut self, peer: PeerId, index: u32) -> bool {
        let total = self.store.total_pieces();
        let bitfield = self
            .bitfields
            .entry(peer)
            .or_insert_with(|| Bitfield::new(total));
        if bitfield.set(index as usize) {
            *self.piece_frequency.entry(index).or_insert(0) += 1;
        }
        self.store.is_interesting(bitfield)
    }

    pub fn is_interesting(&self, peer: &PeerId) -> bool {
        self.bitfields
            .get(peer)
            .is_some_and(|bf| self.store.is_interesting(bf))
    }

    pub fn frequency(&self, index: u32) -> u32 {
        self.piece_frequency.get(&index).copied().unwrap_or(0)
    }

    /// The least-advertised piece we do not hold, lowest index on ties.
    pub fn select_rarest(&self) -> Option<u32> {
        self.rarest_where(|_| true)
    }

    /// Next block to ask `peer` for.
    ///
    /// Blocks of a piece already reserved for `peer` come first. Otherwise the
    /// rarest piece `peer` has that no other connection is fetching gets
    /// reserved.
    pub fn next_block_request(&mut self, peer: &PeerId) -> Option<BlockRequest> {
        let pending = self
            .reserved
            .iter()
            .filter(|(_, p)| p.owner == *peer && p.next_begin < p.length)
            .map(|(&index, _)| index)
            .min();
        let index = match pending {
            Some(index) => index,
            None => {
                let bitfield = self.bitfields.get(peer)?;
                let reserved = &self.reserved;
                let index =
                    self.rarest_where(|i| bitfield.has(i as usize) && !reserved.contains_key(&i))?;
                let length = self.store.get_exact_length(index).ok()? as u32;
                self.reserved.insert(index, PartialPiece::new(*peer, length));
                index
            }
        };

        let partial = self.reserved.get_mut(&index)?;
        let begin = partial.next_begin;
        let length = BLOCK_LENGTH.min(partial.length - begin);
        partial.next_begin += length;
        Some(BlockRequest {
            index,
            begin,
            length,
        })
    }

    /// Files a block `peer` sent for one of its reserved pieces.
    ///
    /// Returns the whole piece, in offset order, once its last block arrives;
    /// the reservation is gone at that point. Blocks for pieces not reserved
    /// for `peer` are dropped.
    pub fn take_block(&mut self, peer: &PeerId, index: u32, begin: u32, block: Bytes) -> Option<Bytes> {
        let partial = self.reserved.get_mut(&index).filter(|p| p.owner == *peer)?;
        if partial.blocks.contains_key(&begin) {
            return None;
        }
        partial.received += block.len() as u32;
        partial.blocks.insert(begin, block);
        if partial.received < partial.length {
            return None;
        }

        let partial = self.reserved.remove(&index)?;
        let mut data = BytesMut::with_capacity(partial.length as usize);
        for block in partial.blocks.values() {
            data.extend_from_slice(block);
        }
        Some(data.freeze())
    }

    /// Drops every reservation held by `peer`.
    pub fn release(&mut self, peer: &PeerId) {
        self.reserved.retain(|_, partial| partial.owner != *peer);
    }

    pub fn release_piece(&mut self, index: u32) {
        self.reserved.remove(&index);
    }

    /// Forgets a departed peer: its bitfield, its counts and its reservations.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.active.remove(peer);
        if let Some(old) = self.bitfields.remove(peer) {
            self.forget(&old);
        }
        self.release(peer);
    }

    /// Recounts every frequency from the stored bitfields.
    pub fn rebuild_frequencies(&mut self) {
        self.piece_frequency.clear();
        for bitfield in self.bitfields.values() {
            for index in bitfield.iter_set() {
                *self.piece_frequency.entry(index as u32).or_insert(0) += 1;
            }
        }
    }

    /// Verifies `piece` and hands it to the store.
    ///
    /// Completion is reported once: later submissions after the store is full
    /// come back as `Duplicate`.
    pub fn accept_piece(&mut self, piece: Piece) -> Result<Acceptance, StoreError> {
        let index = piece.index();
        if !piece.verify() {
            self.reserved.remove(&index);
            return Ok(Acceptance::HashMismatch);
        }
        let added = self.store.add_piece(piece);
        self.reserved.remove(&index);
        if !added? {
            return Ok(Acceptance::Duplicate);
        }
        if self.claim_completion() {
            return Ok(Acceptance::Completed);
        }
        Ok(Acceptance::Stored)
    }

    /// True exactly once, the first time it is called with every piece held.
    ///
    /// A store that starts out full only completes through here when the
    /// caller asks, since no piece submission will ever report it.
    pub fn claim_completion(&mut self) -> bool {
        if self.store.is_complete() && !self.completed {
            self.completed = true;
            return true;
        }
        false
    }

    fn rarest_where(&self, mut eligible: impl FnMut(u32) -> bool) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for (&index, &count) in &self.piece_frequency {
            if count == 0 || self.store.has_piece(index) || !eligible(index) {
                continue;
            }
            if best.is_none_or(|(_, min)| count < min) {
                best = Some((index, count));
            }
        }
        best.map(|(index, _)| index)
    }

    fn forget(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            let index = index as u32;
            if let Some(count) = self.piece_frequency.get_mut(&index) {
                *count -= 1;
                if *count == 0 {
                    self.piece_frequency.remove(&index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u8) -> PeerId {
        [n; 20]
    }

    fn bitfield(total: usize, set: &[usize]) -> Bitfield {
        let mut bf = Bitfield::new(total);
        for &i in set {
            bf.set(i);
        }
        bf
    }

    /// Eight pieces of four bytes each.
    fn state() -> SwarmState {
        SwarmState::new(PieceStore::new(32, 4).unwrap())
    }

    fn piece(index: u32) -> Piece {
        Piece::new(index, Bytes::from(vec![index as u8; 4]))
    }

    #[test]
    fn test_frequency_counts_each_peer_once() {
        let mut s = state();
        assert!(s.report_bitfield(peer(1), bitfield(8, &[0, 1])));
        s.report_bitfield(peer(2), bitfield(8, &[1]));
        s.report_have(peer(2), 1);
        s.report_have(peer(1), 2);
        s.report_have(peer(1), 2);

        assert_eq!(s.frequency(0), 1);
        assert_eq!(s.frequency(1), 2);
        assert_eq!(s.frequency(2), 1);
    }

    #[test]
    fn test_rebitfield_replaces_counts() {
        let mut s = state();
        s.report_bitfield(peer(1), bitfield(8, &[0, 1]));
        s.report_bitfield(peer(1), bitfield(8, &[1, 2]));
        assert_eq!(s.frequency(0), 0);
        assert_eq!(s.frequency(1), 1);
        assert_eq!(s.frequency(2), 1);
    }

    #[test]
    fn test_select_rarest_lowest_index_on_ties() {
        let mut s = state();
        // Frequencies {1: 3, 2: 1, 4: 1}.
        s.report_bitfield(peer(1), bitfield(8, &[1, 2]));
        s.report_bitfield(peer(2), bitfield(8, &[1, 4]));
        s.report_bitfield(peer(3), bitfield(8, &[1]));

        assert_eq!(s.select_rarest(), Some(2));
    }

    #[test]
    fn test_select_rarest_skips_held_pieces() {
        let mut s = state();
        s.report_bitfield(peer(1), bitfield(8, &[2, 3]));
        s.report_bitfield(peer(2), bitfield(8, &[3]));
        s.accept_piece(piece(2)).unwrap();

        assert_eq!(s.select_rarest(), Some(3));
        s.accept_piece(piece(3)).unwrap();
        assert_eq!(s.select_rarest(), None);
    }

    #[test]
    fn test_select_rarest_none_without_peers() {
        assert_eq!(state().select_rarest(), None);
    }

    #[test]
    fn test_next_block_request_is_per_peer_and_reserved() {
        let mut s = state();
        s.report_bitfield(peer(1), bitfield(8, &[5, 6]));
        s.report_bitfield(peer(2), bitfield(8, &[6, 7]));

        let first = s.next_block_request(&peer(1)).unwrap();
        assert_eq!(first, BlockRequest { index: 5, begin: 0, length: 4 });
        let second = s.next_block_request(&peer(1)).unwrap();
        assert_eq!(second.index, 6);
        assert_eq!(s.next_block_request(&peer(1)), None);

        // 6 is taken by peer 1, so peer 2 gets 7.
        assert_eq!(s.next_block_request(&peer(2)).unwrap().index, 7);

        s.release(&peer(1));
        assert_eq!(s.next_block_request(&peer(2)).unwrap().index, 6);
    }

    #[test]
    fn test_last_piece_request_uses_exact_length() {
        let mut s = SwarmState::new(PieceStore::new(10, 4).unwrap());
        s.report_bitfield(peer(1), bitfield(3, &[2]));
        assert_eq!(
            s.next_block_request(&peer(1)),
            Some(BlockRequest { index: 2, begin: 0, length: 2 })
        );
    }

    #[test]
    fn test_long_piece_is_requested_in_blocks() {
        let piece_length = u64::from(BLOCK_LENGTH) * 2 + 100;
        let mut s = SwarmState::new(PieceStore::new(piece_length * 2, piece_length).unwrap());
        s.report_bitfield(peer(1), bitfield(2, &[0, 1]));
        s.report_bitfield(peer(2), bitfield(2, &[0, 1]));

        let requests: Vec<BlockRequest> = (0..3).filter_map(|_| s.next_block_request(&peer(1))).collect();
        assert_eq!(
            requests,
            vec![
                BlockRequest { index: 0, begin: 0, length: BLOCK_LENGTH },
                BlockRequest { index: 0, begin: BLOCK_LENGTH, length: BLOCK_LENGTH },
                BlockRequest { index: 0, begin: 2 * BLOCK_LENGTH, length: 100 },
            ]
        );
        // Piece 0 is spoken for; the other peer starts on piece 1.
        assert_eq!(s.next_block_request(&peer(2)).unwrap().index, 1);

        // Blocks may arrive in any order; the piece is assembled by offset.
        assert_eq!(s.take_block(&peer(1), 0, BLOCK_LENGTH, Bytes::from(vec![2; BLOCK_LENGTH as usize])), None);
        assert_eq!(s.take_block(&peer(2), 0, 0, Bytes::from(vec![9; BLOCK_LENGTH as usize])), None);
        assert_eq!(s.take_block(&peer(1), 0, 2 * BLOCK_LENGTH, Bytes::from(vec![3; 100])), None);
        let data = s
            .take_block(&peer(1), 0, 0, Bytes::from(vec![1; BLOCK_LENGTH as usize]))
            .unwrap();
        assert_eq!(data.len() as u64, piece_length);
        assert_eq!(data[0], 1);
        assert_eq!(data[BLOCK_LENGTH as usize], 2);
        assert_eq!(data[data.len() - 1], 3);

        assert!(s.accept_piece(Piece::new(0, data)).is_ok());
        assert!(s.store.has_piece(0));
    }

    #[test]
    fn test_release_drops_partial_blocks() {
        let piece_length = u64::from(BLOCK_LENGTH) * 2;
        let mut s = SwarmState::new(PieceStore::new(piece_length, piece_length).unwrap());
        s.report_bitfield(peer(1), bitfield(1, &[0]));
        s.next_block_request(&peer(1)).unwrap();
        assert_eq!(s.take_block(&peer(1), 0, 0, Bytes::from(vec![0; BLOCK_LENGTH as usize])), None);

        s.release(&peer(1));
        assert_eq!(
            s.next_block_request(&peer(1)),
            Some(BlockRequest { index: 0, begin: 0, length: BLOCK_LENGTH })
        );
    }

    #[test]
    fn test_empty_store_completes_on_claim() {
        let mut s = SwarmState::new(PieceStore::new(0, 4).unwrap());
        assert!(s.claim_completion());
        assert!(!s.claim_completion());
    }

    #[test]
    fn test_hash_mismatch_is_discarded() {
        let mut s = state();
        s.report_bitfield(peer(1), bitfield(8, &[0]));
        s.next_block_request(&peer(1)).unwrap();

        let corrupt = Piece::with_hash(0, Bytes::from(vec![0u8; 4]), [1u8; 32]);
        assert_eq!(s.accept_piece(corrupt).unwrap(), Acceptance::HashMismatch);
        assert_eq!(s.store.held_count(), 0);
        // The reservation is released so the piece can be fetched again.
        assert_eq!(s.next_block_request(&peer(1)).unwrap().index, 0);
    }

    #[test]
    fn test_completion_reported_once() {
        let mut s = SwarmState::new(PieceStore::new(8, 4).unwrap());
        assert_eq!(s.accept_piece(piece(0)).unwrap(), Acceptance::Stored);
        assert_eq!(s.accept_piece(piece(1)).unwrap(), Acceptance::Completed);
        assert_eq!(s.accept_piece(piece(1)).unwrap(), Acceptance::Duplicate);
    }

    #[test]
    fn test_remove_peer_keeps_invariant() {
        let mut s = state();
        s.register(peer(1));
        s.report_bitfield(peer(1), bitfield(8, &[0, 3]));
        s.report_bitfield(peer(2), bitfield(8, &[3]));
        s.next_block_request(&peer(1)).unwrap();

        s.remove_peer(&peer(1));
        assert_eq!(s.active_peers(), 0);
        assert_eq!(s.frequency(0), 0);
        assert_eq!(s.frequency(3), 1);
        assert_eq!(s.select_rarest(), Some(3));
    }

    #[test]
    fn test_rebuild_matches_incremental_counts() {
        let mut s = state();
        s.report_bitfield(peer(1), bitfield(8, &[0, 1, 2]));
        s.report_have(peer(2), 2);
        s.report_have(peer(3), 7);
        let before: Vec<u32> = (0..8).map(|i| s.frequency(i)).collect();

        s.rebuild_frequencies();
        let after: Vec<u32> = (0..8).map(|i| s.frequency(i)).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut s = state();
        assert!(s.register(peer(1)));
        assert!(!s.register(peer(1)));
    }
}
