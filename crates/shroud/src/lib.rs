//! A BitTorrent swarm engine for anonymizing networks.
//!
//! Peers are not reached over the public internet, the network is an
//! overlay (an I2P-like session) that hands out connections by name. The
//! session may come and go while the torrents keep their state.
//!
//! A [`swarm::Swarm`] owns every torrent and the current
//! [`network::Network`]. Torrents find peers through trackers, peer
//! exchange and a relayed DHT, and download pieces rarest first.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use shroud::{config::Config, network::TcpNetwork, storage::MemoryStorage, swarm::Swarm};
//!
//! # async fn run() -> Result<(), shroud::error::Error> {
//! let swarm = Swarm::new(Arc::new(MemoryStorage::new()), Config::default());
//! swarm.obtained_network(Arc::new(TcpNetwork::bind("127.0.0.1:0").await?));
//!
//! swarm.add_remote_torrent("magnet:?xt=urn:btih:...").await?;
//! swarm.run().await
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod counter;
pub mod error;
pub mod extensions;
pub mod magnet;
pub mod metainfo;
pub mod network;
pub mod peer;
pub mod piece_tracker;
pub mod status;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;
pub mod utils;
pub mod wire;
