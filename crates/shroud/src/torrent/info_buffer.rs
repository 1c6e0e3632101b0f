//! Reassembly of the info dictionary fetched with ut_metadata.

use crate::{
    bitfield::{Bitfield, BitfieldExt},
    error::Error,
    extensions::METADATA_PIECE_LEN,
};

/// Larger advertised sizes are refused.
pub const MAX_METADATA_SIZE: u32 = 8 * 1024 * 1024;

/// The info dictionary being downloaded, in chunks of
/// [`METADATA_PIECE_LEN`].
#[derive(Debug, Default)]
pub struct InfoBuffer {
    bytes: Vec<u8>,
    /// Chunks received.
    received: Bitfield,
    /// Chunks asked to some peer.
    requesting: Bitfield,
}

impl InfoBuffer {
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Size the buffer the first time a peer tells us the metadata size,
    /// later calls are ignored.
    pub fn init(&mut self, size: u32) -> Result<(), Error> {
        if !self.is_empty() {
            return Ok(());
        }
        if size == 0 || size > MAX_METADATA_SIZE {
            return Err(Error::MetadataTooLarge);
        }
        let chunks = (size as usize).div_ceil(METADATA_PIECE_LEN);
        self.bytes = vec![0; size as usize];
        self.received = Bitfield::from_piece(chunks);
        self.requesting = Bitfield::from_piece(chunks);
        Ok(())
    }

    /// A chunk that is neither received nor requested, which becomes
    /// requested.
    pub fn next_request(&mut self) -> Option<u32> {
        let index = (0..self.received.len()).find(|i| {
            !self.received.safe_get(*i) && !self.requesting.safe_get(*i)
        })?;
        self.requesting.safe_set(index);
        Some(index as u32)
    }

    /// Copy a received chunk in, returns true once every chunk is in.
    /// Chunks of the wrong size are dropped.
    pub fn put(&mut self, piece: u32, data: &[u8]) -> bool {
        let begin = piece as usize * METADATA_PIECE_LEN;
        let end = (begin + METADATA_PIECE_LEN).min(self.bytes.len());

        if begin >= self.bytes.len() || data.len() != end - begin {
            self.unset_requesting(piece);
            return false;
        }

        self.bytes[begin..end].copy_from_slice(data);
        self.received.safe_set(piece as usize);
        self.requesting.safe_unset(piece as usize);
        self.received.completed()
    }

    pub fn unset_requesting(&mut self, piece: u32) {
        self.requesting.safe_unset(piece as usize);
    }

    /// Allow every missing chunk to be asked again.
    pub fn reset_requesting(&mut self) {
        self.requesting.fill(false);
    }

    /// Drop everything received.
    pub fn reset(&mut self) {
        self.received.fill(false);
        self.requesting.fill(false);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
