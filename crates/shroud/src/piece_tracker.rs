//! Block level scheduling of the pieces being downloaded.
//!
//! A piece is split in blocks of [`BLOCK_LEN`] and every block is either
//! missing, pending (asked to some peer) or obtained. The tracker keeps one
//! [`CachedPiece`] per piece being assembled, each behind its own lock, so
//! connections working on different pieces don't wait for each other.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use hashbrown::HashMap;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    storage::TorrentStorage,
    utils::lock,
    wire::{Block, BlockInfo, BLOCK_LEN},
};

/// A piece without any block activity for this long has its pending
/// blocks reset.
pub const PIECE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// A piece being assembled.
#[derive(Debug)]
pub struct CachedPiece {
    pub index: u32,
    pub length: u32,
    pub pending: Bitfield,
    pub obtained: Bitfield,
    pub last_active: Instant,
}

impl CachedPiece {
    pub fn new(index: u32, length: u32) -> Self {
        let blocks = length.div_ceil(BLOCK_LEN) as usize;
        Self {
            index,
            length,
            pending: Bitfield::from_piece(blocks),
            obtained: Bitfield::from_piece(blocks),
            last_active: Instant::now(),
        }
    }

    fn block_index(offset: u32) -> usize {
        (offset / BLOCK_LEN) as usize
    }

    fn final_block_index(&self) -> usize {
        Self::block_index(self.length.saturating_sub(1))
    }

    fn final_block_len(&self) -> u32 {
        match self.length % BLOCK_LEN {
            0 => BLOCK_LEN,
            rem => rem,
        }
    }

    /// Whether a chunk at `offset` of `len` bytes fits the block layout.
    pub fn accept(&self, offset: u32, len: u32) -> bool {
        if offset % BLOCK_LEN != 0 {
            warn!("piece {} rejecting unaligned offset {offset}", self.index);
            return false;
        }
        if offset as u64 + len as u64 > self.length as u64 {
            warn!(
                "piece {} rejecting chunk ending at {} past {}",
                self.index,
                offset as u64 + len as u64,
                self.length
            );
            return false;
        }

        let expected = if Self::block_index(offset) == self.final_block_index() {
            self.final_block_len()
        } else {
            BLOCK_LEN
        };
        if len != expected {
            warn!(
                "piece {} rejecting chunk at {offset} of {len} bytes, expected {expected}",
                self.index
            );
            return false;
        }

        true
    }

    pub fn done(&self) -> bool {
        self.obtained.completed()
    }

    /// Mark the block at `offset` obtained.
    pub fn put(&mut self, offset: u32) {
        let idx = Self::block_index(offset);
        self.obtained.safe_set(idx);
        self.pending.safe_unset(idx);
        self.last_active = Instant::now();
    }

    /// Return the block at `offset` to missing.
    pub fn cancel(&mut self, offset: u32) {
        self.pending.safe_unset(Self::block_index(offset));
        self.last_active = Instant::now();
    }

    /// The first block that is neither pending nor obtained, which becomes
    /// pending.
    pub fn next_request(&mut self) -> Option<BlockInfo> {
        let mut begin = 0;
        while begin < self.length {
            let idx = Self::block_index(begin);
            if !self.pending.safe_get(idx) && !self.obtained.safe_get(idx) {
                let len = if idx == self.final_block_index() {
                    self.final_block_len()
                } else {
                    BLOCK_LEN
                };
                self.pending.safe_set(idx);
                debug!("next request piece {} offset {begin} len {len}", self.index);
                return Some(BlockInfo { index: self.index, begin, len });
            }
            begin += BLOCK_LEN;
        }
        None
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) > PIECE_EXPIRY
    }
}

/// What happened to a chunk handed to [`PieceTracker::handle_piece_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    /// The chunk doesn't fit the piece, nothing changed.
    Rejected,
    /// The chunk was written, the piece is still incomplete.
    Stored,
    /// Storage refused the chunk, its block is missing again.
    StoreFailed,
    /// The last chunk arrived and the piece hashed correctly.
    Completed(u32),
    /// The last chunk arrived but the piece hash is wrong, the piece is
    /// dropped and will be selected again later.
    Invalid(u32),
}

/// Owns the pieces being assembled of one torrent.
pub struct PieceTracker {
    storage: Arc<dyn TorrentStorage>,
    pieces: Mutex<HashMap<u32, Arc<Mutex<CachedPiece>>>>,
    /// Serializes the calls into storage.
    access: Mutex<()>,
}

impl PieceTracker {
    pub fn new(storage: Arc<dyn TorrentStorage>) -> Self {
        Self {
            storage,
            pieces: Mutex::new(HashMap::new()),
            access: Mutex::new(()),
        }
    }

    fn get(&self, index: u32) -> Option<Arc<Mutex<CachedPiece>>> {
        lock(&self.pieces).get(&index).cloned()
    }

    fn get_or_create(&self, index: u32) -> Option<Arc<Mutex<CachedPiece>>> {
        let mut pieces = lock(&self.pieces);
        if let Some(piece) = pieces.get(&index) {
            return Some(piece.clone());
        }
        let length = self.storage.piece_length(index)?;
        debug!("new piece {index} of {length} bytes");
        let piece = Arc::new(Mutex::new(CachedPiece::new(index, length)));
        pieces.insert(index, piece.clone());
        Some(piece)
    }

    fn remove(&self, index: u32) {
        lock(&self.pieces).remove(&index);
    }

    /// Number of pieces being assembled.
    pub fn len(&self) -> usize {
        lock(&self.pieces).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: u32) -> bool {
        lock(&self.pieces).contains_key(&index)
    }

    /// Pieces with at least one block asked to some peer.
    pub fn pending_pieces(&self) -> Vec<u32> {
        let pieces: Vec<_> = lock(&self.pieces).values().cloned().collect();
        pieces
            .iter()
            .filter_map(|p| {
                let p = lock(p);
                p.pending.any().then_some(p.index)
            })
            .collect()
    }

    /// The next block to ask a peer for.
    ///
    /// The piece of `last` is continued while it has missing blocks,
    /// otherwise `pick` chooses a new piece given the pieces that are
    /// already pending elsewhere.
    pub fn next_request<F>(&self, last: Option<&BlockInfo>, pick: F) -> Option<BlockInfo>
    where
        F: FnOnce(&[u32]) -> Option<u32>,
    {
        if let Some(piece) = last.and_then(|last| self.get(last.index)) {
            if let Some(r) = lock(&piece).next_request() {
                return Some(r);
            }
        }

        let exclude = self.pending_pieces();
        let index = pick(&exclude)?;
        let piece = self.get_or_create(index)?;
        let r = lock(&piece).next_request();
        r
    }

    /// A request that will not be answered, its block can be selected again.
    pub fn canceled_request(&self, info: &BlockInfo) {
        if info.len == 0 {
            return;
        }
        if let Some(piece) = self.get(info.index) {
            lock(&piece).cancel(info.begin);
        }
    }

    /// Store a chunk received from a peer and verify the piece once every
    /// block is in.
    pub fn handle_piece_data(&self, block: &Block) -> PieceOutcome {
        let index = block.index;
        let Some(piece) = self.get_or_create(index) else {
            warn!("piece data for unknown piece {index}");
            return PieceOutcome::Rejected;
        };
        let mut piece = lock(&piece);

        if !piece.accept(block.begin, block.block.len() as u32) {
            return PieceOutcome::Rejected;
        }

        let _access = lock(&self.access);

        match self.storage.put_chunk(block) {
            Ok(()) => piece.put(block.begin),
            Err(e) => {
                piece.cancel(block.begin);
                error!("failed to put chunk of piece {index}: {e}");
                return PieceOutcome::StoreFailed;
            }
        }

        if !piece.done() {
            return PieceOutcome::Stored;
        }

        let outcome = match self.storage.verify_piece(index) {
            Ok(()) => {
                if let Err(e) = self.storage.flush() {
                    warn!("flush after piece {index} failed: {e}");
                }
                PieceOutcome::Completed(index)
            }
            Err(e) => {
                warn!("piece {index} failed verification: {e}");
                PieceOutcome::Invalid(index)
            }
        };
        drop(piece);
        self.remove(index);
        outcome
    }

    /// Read a block to upload.
    pub fn read_block(&self, info: &BlockInfo) -> Result<Block, Error> {
        let _access = lock(&self.access);
        self.storage.get_piece(info)
    }

    /// Reset the pending blocks of pieces that saw no activity for
    /// [`PIECE_EXPIRY`], returns the pieces whose requests must be
    /// cancelled on every connection.
    pub fn expire(&self, now: Instant) -> Vec<u32> {
        let pieces: Vec<_> = lock(&self.pieces).values().cloned().collect();
        let mut expired = Vec::new();

        for piece in pieces {
            let mut piece = lock(&piece);
            if !piece.is_expired(now) {
                continue;
            }
            if piece.pending.any() {
                piece.pending.fill(false);
                debug!("expired piece {} with no recent activity", piece.index);
                expired.push(piece.index);
            }
            piece.last_active = now;
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::Info, storage::MemoryTorrent};

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    fn tracker(data: &[u8], piece_length: u32) -> (PieceTracker, Arc<MemoryTorrent>) {
        let info = Info::new("t", piece_length, None, data).unwrap();
        let storage = Arc::new(MemoryTorrent::new(info));
        (PieceTracker::new(storage.clone()), storage)
    }

    fn block(data: &[u8], piece_length: u32, r: &BlockInfo) -> Block {
        let begin = (r.index * piece_length + r.begin) as usize;
        Block {
            index: r.index,
            begin: r.begin,
            block: data[begin..begin + r.len as usize].to_vec(),
        }
    }

    #[test]
    fn two_blocks_then_nothing() {
        let mut piece = CachedPiece::new(0, 32768);
        assert_eq!(piece.next_request().map(|r| r.begin), Some(0));
        assert_eq!(piece.next_request().map(|r| r.begin), Some(16384));
        assert_eq!(piece.next_request(), None);
    }

    #[test]
    fn every_offset_once() {
        let length = 3 * BLOCK_LEN + 100;
        let mut piece = CachedPiece::new(7, length);
        let mut seen = Vec::new();
        while let Some(r) = piece.next_request() {
            assert_eq!(r.index, 7);
            seen.push((r.begin, r.len));
        }
        assert_eq!(
            seen,
            vec![
                (0, BLOCK_LEN),
                (BLOCK_LEN, BLOCK_LEN),
                (2 * BLOCK_LEN, BLOCK_LEN),
                (3 * BLOCK_LEN, 100)
            ]
        );
    }

    #[test]
    fn accept_block_layout() {
        let piece = CachedPiece::new(0, BLOCK_LEN + 10);
        assert!(piece.accept(0, BLOCK_LEN));
        assert!(piece.accept(BLOCK_LEN, 10));
        assert!(!piece.accept(1, BLOCK_LEN));
        assert!(!piece.accept(0, 10));
        assert!(!piece.accept(BLOCK_LEN, 9));
        assert!(!piece.accept(BLOCK_LEN, BLOCK_LEN));

        // aligned length, the final block is a full one
        let piece = CachedPiece::new(0, 2 * BLOCK_LEN);
        assert!(piece.accept(BLOCK_LEN, BLOCK_LEN));
    }

    #[test]
    fn cancel_returns_block() {
        let mut piece = CachedPiece::new(0, 2 * BLOCK_LEN);
        let first = piece.next_request().unwrap();
        piece.next_request().unwrap();
        piece.cancel(first.begin);
        assert_eq!(piece.next_request(), Some(first));
    }

    #[test]
    fn rejected_chunk_changes_nothing() {
        let data = data(2 * BLOCK_LEN as usize);
        let (tracker, _) = tracker(&data, 2 * BLOCK_LEN);

        let r = tracker.next_request(None, |_| Some(0)).unwrap();
        let mut bad = block(&data, 2 * BLOCK_LEN, &r);
        bad.begin = 3;
        assert_eq!(tracker.handle_piece_data(&bad), PieceOutcome::Rejected);

        let piece = tracker.get(0).unwrap();
        let piece = lock(&piece);
        assert_eq!(piece.pending.count_set(), 1);
        assert_eq!(piece.obtained.count_set(), 0);
    }

    #[test]
    fn download_piece() {
        let piece_length = 2 * BLOCK_LEN;
        let data = data(piece_length as usize + 500);
        let (tracker, storage) = tracker(&data, piece_length);

        let mut last = None;
        let mut outcomes = Vec::new();
        while let Some(r) = tracker.next_request(last.as_ref(), |exclude| {
            (0..2).find(|i| !exclude.contains(i) && !storage.bitfield().unwrap()[*i as usize])
        }) {
            outcomes.push(tracker.handle_piece_data(&block(&data, piece_length, &r)));
            last = Some(r);
        }

        assert_eq!(
            outcomes,
            vec![
                PieceOutcome::Stored,
                PieceOutcome::Completed(0),
                PieceOutcome::Completed(1)
            ]
        );
        assert!(tracker.is_empty());
        assert!(storage.bitfield().unwrap().completed());
        assert_eq!(storage.bytes(), data);
    }

    #[test]
    fn invalid_piece_is_dropped() {
        let data = data(BLOCK_LEN as usize);
        let (tracker, storage) = tracker(&data, BLOCK_LEN);

        let r = tracker.next_request(None, |_| Some(0)).unwrap();
        let mut corrupt = block(&data, BLOCK_LEN, &r);
        corrupt.block[0] ^= 0xff;

        assert_eq!(tracker.handle_piece_data(&corrupt), PieceOutcome::Invalid(0));
        assert!(!tracker.contains(0));
        assert!(!storage.bitfield().unwrap()[0]);
    }

    #[test]
    fn pending_pieces_are_excluded() {
        let data = data(4 * BLOCK_LEN as usize);
        let (tracker, _) = tracker(&data, BLOCK_LEN);

        tracker.next_request(None, |_| Some(2)).unwrap();
        let mut excluded = Vec::new();
        tracker.next_request(None, |exclude| {
            excluded = exclude.to_vec();
            None
        });
        assert_eq!(excluded, vec![2]);

        let r = BlockInfo::new().index(2).begin(0).len(BLOCK_LEN);
        tracker.canceled_request(&r);
        assert!(tracker.pending_pieces().is_empty());
    }

    #[test]
    fn expire_resets_pending() {
        let data = data(2 * BLOCK_LEN as usize);
        let (tracker, _) = tracker(&data, 2 * BLOCK_LEN);

        tracker.next_request(None, |_| Some(0)).unwrap();
        let now = Instant::now();
        assert!(tracker.expire(now).is_empty());

        let later = now + PIECE_EXPIRY + Duration::from_secs(1);
        assert_eq!(tracker.expire(later), vec![0]);
        assert!(tracker.pending_pieces().is_empty());
        // activity was reset, nothing expires twice
        assert!(tracker.expire(later).is_empty());
    }
}
