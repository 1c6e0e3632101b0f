//! The storage collaborator.
//!
//! Torrents never touch the filesystem, every byte goes through a
//! [`TorrentStorage`]. Calls are synchronous and cheap enough to run on the
//! async workers, an implementation that blocks for long should hand the
//! work to its own threads.
mod memory;

pub use memory::*;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    bitfield::Bitfield,
    error::Error,
    metainfo::{Info, MetaInfo},
    status::FileStatus,
    torrent::InfoHash,
    wire::{Block, BlockInfo},
};

/// Persisted transfer totals of a torrent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Storage of a single torrent.
pub trait TorrentStorage: Send + Sync + 'static {
    fn info_hash(&self) -> InfoHash;

    fn name(&self) -> String;

    /// `None` while the info dictionary is unknown.
    fn meta_info(&self) -> Option<Arc<Info>>;

    /// Create the backing files.
    fn allocate(&self) -> Result<(), Error>;

    /// Hash every piece and rebuild the bitfield.
    fn verify_all(&self) -> Result<(), Error>;

    /// A [`TorrentStorage::verify_all`] pass is running.
    fn checking(&self) -> bool;

    fn put_chunk(&self, block: &Block) -> Result<(), Error>;

    fn get_piece(&self, info: &BlockInfo) -> Result<Block, Error>;

    /// Hash the piece and mark it in the bitfield when it matches.
    fn verify_piece(&self, index: u32) -> Result<(), Error>;

    /// Pieces we have, `None` while the info dictionary is unknown.
    fn bitfield(&self) -> Option<Bitfield>;

    fn download_remaining(&self) -> u64;

    fn flush(&self) -> Result<(), Error>;

    /// Remove the data of this torrent.
    fn delete(&self) -> Result<(), Error>;

    fn save_stats(&self, stats: &TransferStats) -> Result<(), Error>;

    fn stats(&self) -> TransferStats;

    fn file_list(&self) -> Vec<FileStatus>;

    /// Run a deep verification, `Ok(true)` if every piece is good and the
    /// torrent can be seeded.
    fn seed(&self) -> Result<bool, Error>;

    /// Store the info dictionary fetched from peers. Fails if it does not
    /// hash to the info hash.
    fn put_info(&self, bytes: &[u8]) -> Result<(), Error>;

    /// Length of a piece, `None` if out of range or the info is unknown.
    fn piece_length(&self, index: u32) -> Option<u32> {
        self.meta_info()?.piece_size(index)
    }

    fn num_pieces(&self) -> Option<u32> {
        Some(self.meta_info()?.num_pieces())
    }
}

/// Opens torrents, this is what a swarm is given.
pub trait Storage: Send + Sync + 'static {
    /// A torrent known only by its info hash, as added from a magnet.
    fn empty_torrent(
        &self,
        info_hash: InfoHash,
        name: &str,
    ) -> Result<Arc<dyn TorrentStorage>, Error>;

    fn open_torrent(
        &self,
        meta_info: &MetaInfo,
    ) -> Result<Arc<dyn TorrentStorage>, Error>;
}
