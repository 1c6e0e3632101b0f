//! The transport the swarm runs on.
//!
//! The engine never opens sockets by itself, it asks a [`Network`] to dial,
//! accept and resolve names. Anonymizing networks plug in here, and
//! [`TcpNetwork`] is a plain TCP implementation.
mod tcp;

pub use tcp::*;

use std::fmt::Display;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;

/// Port announced to trackers when the network address has none.
pub const DEFAULT_PORT: u16 = 6881;

/// A reliable byte stream to a remote peer.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Conn for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxConn = Box<dyn Conn>;

/// Address of a peer in whatever form the network understands, a
/// `host:port` pair for TCP or a destination for overlay networks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr(pub String);

impl PeerAddr {
    /// The part after the last `:`, if it is a port.
    pub fn port(&self) -> Option<u16> {
        let (_, port) = self.0.rsplit_once(':')?;
        port.parse().ok()
    }
}

impl Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddr {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for PeerAddr {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A network session. It is shared by every torrent of a swarm and may be
/// replaced when the session is lost.
pub trait Network: Send + Sync + 'static {
    fn dial<'a>(
        &'a self,
        addr: &'a PeerAddr,
    ) -> BoxFuture<'a, Result<BoxConn, Error>>;

    /// Wait for the next inbound connection. An [`Error::NetworkClosed`]
    /// means the session is gone for good.
    fn accept(&self) -> BoxFuture<'_, Result<(BoxConn, PeerAddr), Error>>;

    /// Resolve a name into a dialable address.
    fn lookup<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<PeerAddr, Error>>;

    /// Our own address on this network.
    fn addr(&self) -> PeerAddr;
}
