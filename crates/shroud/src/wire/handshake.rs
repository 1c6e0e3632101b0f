//! The handshake is the very first thing exchanged on a connection.
//!
//! It has a different structure than the rest of the messages and is sent
//! exactly once, so instead of a codec it is read and written as a fixed
//! 68 byte block. Nothing is buffered past it and the stream can be handed
//! to the [`super::MessageCodec`] right after.

use speedy::{BigEndian, Readable, Writable};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::PSTR;
use crate::{
    bitfield::Reserved, error::Error, peer::PeerId, torrent::InfoHash,
};

pub const HANDSHAKE_LEN: usize = 68;

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field is a bitmask of the extensions the peer
/// supports. The peer id is usually the client name and version.
#[derive(Clone, Debug, PartialEq, Eq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: Reserved::supported().into(),
            info_hash,
            peer_id,
        }
    }

    pub fn reserved(&self) -> Reserved {
        Reserved::from(self.reserved)
    }

    pub fn serialize(&self) -> Result<[u8; HANDSHAKE_LEN], Error> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    /// Decode and validate the protocol name.
    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(Error::HandshakeInvalid);
        }
        let handshake = Self::read_from_buffer_with_ctx(BigEndian {}, buf)?;
        if handshake.pstr_len as usize != PSTR.len() {
            warn!("handshake with wrong pstr_len, dropping connection");
            return Err(Error::HandshakeInvalid);
        }
        if handshake.pstr != PSTR {
            warn!("handshake with wrong pstr, dropping connection");
            return Err(Error::HandshakeInvalid);
        }
        Ok(handshake)
    }

    pub async fn send<W>(&self, w: &mut W) -> Result<(), Error>
    where
        W: AsyncWrite + Unpin,
    {
        w.write_all(&self.serialize()?).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn recv<R>(r: &mut R) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LEN];
        r.read_exact(&mut buf).await?;
        Self::deserialize(&buf)
    }
}
