//! Peer exchange.
//!
//! Addresses on overlay networks are opaque strings, so instead of the
//! compact ipv4 format of `ut_pex` the lists carry address strings.

use std::sync::Mutex;

use bendy::{
    decoding::{self, FromBencode, Object, ResultExt},
    encoding::ToBencode,
};
use hashbrown::HashMap;

use crate::{error::Error, network::PeerAddr};

/// Maximum number of connected peers sent in one message.
pub const MAX_PEX_PEERS: usize = 15;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pex {
    pub added: Vec<PeerAddr>,
    pub dropped: Vec<PeerAddr>,
}

impl Pex {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_bencode()?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(buf)?)
    }
}

fn strings(addrs: &[PeerAddr]) -> Vec<&str> {
    addrs.iter().map(|a| a.0.as_str()).collect()
}

impl ToBencode for Pex {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"added", strings(&self.added))?;
            e.emit_pair(b"dropped", strings(&self.dropped))
        })
    }
}

impl FromBencode for Pex {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut pex = Pex::default();
        let mut dict_dec = object.try_into_dictionary()?;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"added", value) => {
                    pex.added = Vec::<String>::decode_bencode_object(value)
                        .context("added")?
                        .into_iter()
                        .map(PeerAddr)
                        .collect();
                }
                (b"dropped", value) => {
                    pex.dropped = Vec::<String>::decode_bencode_object(value)
                        .context("dropped")?
                        .into_iter()
                        .map(PeerAddr)
                        .collect();
                }
                _ => {}
            }
        }

        Ok(pex)
    }
}

/// Connections opened and closed on a torrent since the last exchange.
#[derive(Debug, Default)]
pub struct PexState {
    peers: Mutex<HashMap<PeerAddr, bool>>,
}

impl PexState {
    pub fn on_connected(&self, addr: &PeerAddr) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(addr.clone(), true);
        }
    }

    pub fn on_disconnected(&self, addr: &PeerAddr) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(addr.clone(), false);
        }
    }

    /// Up to [`MAX_PEX_PEERS`] connected peers and every peer that
    /// disconnected, which are then forgotten.
    pub fn pop(&self) -> Pex {
        let mut pex = Pex::default();
        let Ok(mut peers) = self.peers.lock() else { return pex };

        peers.retain(|addr, connected| {
            if *connected {
                if pex.added.len() < MAX_PEX_PEERS {
                    pex.added.push(addr.clone());
                }
                true
            } else {
                pex.dropped.push(addr.clone());
                false
            }
        });

        pex.added.sort();
        pex.dropped.sort();
        pex
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bencode() {
        let pex = Pex {
            added: vec![PeerAddr::from("a.b32.i2p"), PeerAddr::from("127.0.0.1:1")],
            dropped: vec![PeerAddr::from("c.b32.i2p")],
        };
        let bytes = pex.to_bytes().unwrap();
        assert_eq!(
            bytes,
            b"d5:addedl9:a.b32.i2p11:127.0.0.1:1e7:droppedl9:c.b32.i2pee"
        );
        assert_eq!(Pex::from_bytes(&bytes).unwrap(), pex);
    }

    #[test]
    fn pop_forgets_dropped() {
        let state = PexState::default();
        let a = PeerAddr::from("a");
        let b = PeerAddr::from("b");

        state.on_connected(&a);
        state.on_connected(&b);
        state.on_disconnected(&b);

        let pex = state.pop();
        assert_eq!(pex.added, vec![a.clone()]);
        assert_eq!(pex.dropped, vec![b]);

        let pex = state.pop();
        assert_eq!(pex.added, vec![a]);
        assert!(pex.dropped.is_empty());
    }

    #[test]
    fn pop_caps_added() {
        let state = PexState::default();
        for i in 0..40 {
            state.on_connected(&PeerAddr(format!("peer{i}")));
        }
        assert_eq!(state.pop().added.len(), MAX_PEX_PEERS);
    }
}
