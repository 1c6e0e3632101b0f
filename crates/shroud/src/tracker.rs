//! Tracker announces.
//!
//! The announce wire format depends on the network, so the engine only knows
//! the [`Announcer`] contract. The torrent drives the timing, see
//! [`crate::torrent`].

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::{
    error::Error, network::PeerAddr, peer::PeerId, torrent::InfoHash,
};

/// Peers asked for on every announce.
pub const DEFAULT_NUM_WANT: u32 = 10;

/// Interval used when a tracker doesn't tell us one.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Event {
    /// A regular announce.
    #[default]
    None,
    Completed,
    Started,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub event: Event,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub num_want: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnnounceResponse {
    pub peers: Vec<PeerAddr>,
    /// How long until the next regular announce.
    pub interval: Duration,
    /// Failure reason sent by the tracker.
    pub error: Option<String>,
}

pub trait Announcer: Send + Sync + 'static {
    /// Name used in logs and as the key of this tracker in a torrent.
    fn name(&self) -> String;

    fn announce(
        &self,
        req: AnnounceRequest,
    ) -> BoxFuture<'_, Result<AnnounceResponse, Error>>;
}

/// Builds an announcer out of a tracker url, `None` for urls the network
/// can't reach.
pub type TrackerFactory =
    Arc<dyn Fn(&str) -> Option<Arc<dyn Announcer>> + Send + Sync>;
