//! Snapshots handed to the management layer.

use serde::{Deserialize, Serialize};

use crate::{torrent::TorrentState, utils};

/// Progress of one file of a torrent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatus {
    pub name: String,
    pub length: u64,
    pub progress: f64,
}

/// One connection, as seen at the time of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConnStats {
    /// Upload rate, bytes per second.
    pub tx: u64,
    /// Download rate, bytes per second.
    pub rx: u64,
    /// Peer id, percent encoded.
    pub id: String,
    /// Client name from the extension handshake.
    pub client: String,
    pub addr: String,
    pub us_interested: bool,
    pub us_choking: bool,
    pub them_interested: bool,
    pub them_choking: bool,
    pub downloading: bool,
    pub inbound: bool,
    pub uploading: bool,
    /// The remote bitfield, raw bytes.
    pub bitfield: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentStatus {
    pub files: Vec<FileStatus>,
    pub peers: Vec<PeerConnStats>,
    pub name: String,
    pub state: TorrentState,
    pub infohash: String,
    pub progress: f64,
    pub tx: u64,
    pub rx: u64,
    pub uploaded: u64,
    pub downloaded: u64,
}

impl TorrentStatus {
    pub fn ratio(&self) -> f64 {
        utils::ratio(self.uploaded, self.downloaded)
    }
}

impl std::fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {:.1}% peers: {} down: {}/s up: {}/s ratio: {:.2}",
            self.name,
            self.state,
            self.progress * 100.0,
            self.peers.len(),
            utils::to_human_readable(self.rx),
            utils::to_human_readable(self.tx),
            self.ratio(),
        )
    }
}

/// Every torrent of a swarm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmStatus {
    pub torrents: Vec<TorrentStatus>,
}

impl SwarmStatus {
    /// Total upload rate.
    pub fn tx(&self) -> u64 {
        self.torrents.iter().map(|t| t.tx).sum()
    }

    /// Total download rate.
    pub fn rx(&self) -> u64 {
        self.torrents.iter().map(|t| t.rx).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let status = TorrentStatus {
            files: vec![],
            peers: vec![],
            name: "debian.iso".to_owned(),
            state: TorrentState::Downloading,
            infohash: String::new(),
            progress: 0.5,
            tx: 1500,
            rx: 2_000_000,
            uploaded: 10,
            downloaded: 20,
        };
        assert_eq!(
            status.to_string(),
            "debian.iso [downloading] 50.0% peers: 0 down: 2.00 MB/s up: 1.50 KB/s ratio: 0.50"
        );

        let swarm = SwarmStatus { torrents: vec![status.clone(), status] };
        assert_eq!(swarm.tx(), 3000);
        assert_eq!(swarm.rx(), 4_000_000);
    }
}
