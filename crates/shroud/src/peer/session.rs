use std::time::Duration;

use hashbrown::HashSet;
use tokio::time::Instant;

use crate::{bitfield::Bitfield, extensions::Extension, wire::BlockInfo};

/// The value of outstanding blocks we tell peers we accept, in the `reqq`
/// key of the extension handshake.
pub const DEFAULT_REQUEST_QUEUE_LEN: u16 = 250;

/// Capacity of the outbound queue, producers wait when it is full.
pub const SEND_QUEUE_LEN: usize = 128;

/// How often the coalescing buffer is written out.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Messages larger than this are written right away, and the coalescing
/// buffer is flushed before it grows past it.
pub const COALESCE_THRESHOLD: usize = 1000;

/// Send a keep-alive after this long without writing anything.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// How long to wait before asking the piece tracker again after it had
/// nothing for this peer.
pub const REQUEST_BACKOFF: Duration = Duration::from_millis(250);

/// Contains the state of both sides of the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreState {
    /// If we're choking, we don't serve the requests of the peer.
    pub am_choking: bool,

    /// If we're interested, peer has pieces that we don't have.
    pub am_interested: bool,

    /// If peer is choking, they don't serve our requests.
    pub peer_choking: bool,

    /// If peer is interested in us, they mean to download pieces that we have.
    pub peer_interested: bool,
}

impl Default for CoreState {
    /// Both sides start off choked, and we assume we want something until
    /// the bitfields say otherwise.
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: true,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Holds and provides facilities to modify the state of a peer session.
#[derive(Debug)]
pub struct Session {
    pub state: CoreState,

    /// Pieces of the remote, `None` until the first bitfield.
    pub bitfield: Option<Bitfield>,

    /// Requests sent to the peer that were not answered yet.
    pub downloading: Vec<BlockInfo>,

    /// The last block asked to this peer, used to keep working on the same
    /// piece.
    pub last_request: Option<BlockInfo>,

    /// Don't ask the piece tracker for work before this.
    pub next_request_at: Instant,

    /// Extension handshake of the remote.
    pub extension: Option<Extension>,

    /// Piece messages queued for the remote that were not cancelled.
    pub queued_uploads: HashSet<BlockInfo>,

    /// We told the peer whether we're interested at least once.
    pub sent_interested: bool,

    /// The download driver may run, set on the first bitfield of a ready
    /// torrent.
    pub run_download: bool,

    /// The completion of the torrent was handled for this peer.
    pub done_fired: bool,

    /// The peer asked us for a block at least once.
    pub uploading: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: CoreState::default(),
            bitfield: None,
            downloading: Vec::new(),
            last_request: None,
            next_request_at: Instant::now(),
            extension: None,
            queued_uploads: HashSet::new(),
            sent_interested: false,
            run_download: false,
            done_fired: false,
            uploading: false,
        }
    }
}

impl Session {
    /// Take every in flight request out of the session.
    pub fn take_downloading(&mut self) -> Vec<BlockInfo> {
        std::mem::take(&mut self.downloading)
    }

    /// Remove the request answered by `info`, returns false if we never
    /// asked for it.
    pub fn complete_request(&mut self, info: &BlockInfo) -> bool {
        let Some(pos) = self.downloading.iter().position(|r| r == info) else {
            return false;
        };
        self.downloading.remove(pos);
        true
    }

    /// Remove the in flight requests of piece `index`.
    pub fn take_piece(&mut self, index: u32) -> Vec<BlockInfo> {
        let (taken, kept) = self
            .take_downloading()
            .into_iter()
            .partition(|r| r.index == index);
        self.downloading = kept;
        taken
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.as_ref().is_some_and(|b| {
            b.get(index as usize).is_some_and(|bit| *bit)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let state = CoreState::default();
        assert!(state.am_choking);
        assert!(state.peer_choking);
        assert!(state.am_interested);
        assert!(!state.peer_interested);
    }

    #[test]
    fn request_bookkeeping() {
        let mut session = Session::default();
        let a = BlockInfo::new().index(0).begin(0).len(16384);
        let b = BlockInfo::new().index(1).begin(0).len(16384);
        let c = BlockInfo::new().index(1).begin(16384).len(100);
        session.downloading = vec![a, b, c];

        assert!(session.complete_request(&a));
        assert!(!session.complete_request(&a));

        let taken = session.take_piece(1);
        assert_eq!(taken, vec![b, c]);
        assert!(session.downloading.is_empty());
    }
}
