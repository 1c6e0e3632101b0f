//! Extension protocol, BEP 10 <http://www.bittorrent.org/beps/bep_0010.html>
//!
//! Peers exchange a table of `name -> id` in the extension handshake.
//! Messages we receive carry the id from *our* table, messages we send
//! carry the id from *theirs*.

pub mod metadata;
pub mod pex;

pub use metadata::*;
pub use pex::*;

use std::collections::BTreeMap;

use bendy::{
    decoding::{FromBencode, Object, ResultExt},
    encoding::{SingleItemEncoder, ToBencode},
};

use crate::{error::Error, peer::session::DEFAULT_REQUEST_QUEUE_LEN, wire::ExtendedMessage};

/// Id of the extension handshake.
pub const HANDSHAKE_ID: u8 = 0;

pub const UT_METADATA: &str = "ut_metadata";
pub const PEX: &str = "shroud_pex";
pub const XDHT: &str = "xdht";

/// Client name sent in the `v` key.
pub const CLIENT_NAME: &str = concat!("shroud ", env!("CARGO_PKG_VERSION"));

/// The extensions this client knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    PeerExchange,
    DhtRelay,
    Metadata,
    Unknown,
}

impl ExtensionKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            UT_METADATA => Self::Metadata,
            PEX => Self::PeerExchange,
            XDHT => Self::DhtRelay,
            _ => Self::Unknown,
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Metadata => Some(UT_METADATA),
            Self::PeerExchange => Some(PEX),
            Self::DhtRelay => Some(XDHT),
            Self::Unknown => None,
        }
    }
}

/// This is the payload of the extension handshake.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extension {
    /// messages (supported extensions), an id of 0 disables the extension
    pub m: BTreeMap<String, u8>,
    /// a string identifying the client and the version
    pub v: Option<String>,
    /// number of outstanding requests messages this client supports
    /// without dropping any.
    pub reqq: Option<u16>,
    /// added by BEP 9
    /// the size of the metadata file, which is the
    /// info-dictionary part of the metainfo(.torrent) file
    pub metadata_size: Option<u32>,
}

impl Extension {
    /// The extensions we advertise, ids are assigned in order.
    pub fn supported(metadata_size: Option<u32>, dht: bool) -> Self {
        let mut kinds = vec![ExtensionKind::PeerExchange, ExtensionKind::Metadata];
        if dht {
            kinds.push(ExtensionKind::DhtRelay);
        }

        let m = kinds
            .into_iter()
            .filter_map(|k| k.name())
            .zip(1u8..)
            .map(|(name, id)| (name.to_owned(), id))
            .collect();

        Self {
            m,
            v: Some(CLIENT_NAME.to_owned()),
            reqq: Some(DEFAULT_REQUEST_QUEUE_LEN),
            metadata_size,
        }
    }

    /// Id of `kind` in this table.
    pub fn id_of(&self, kind: ExtensionKind) -> Option<u8> {
        self.m.get(kind.name()?).copied().filter(|id| *id != 0)
    }

    /// Which extension owns `id` in this table.
    pub fn kind_of(&self, id: u8) -> ExtensionKind {
        if id == HANDSHAKE_ID {
            return ExtensionKind::Unknown;
        }
        self.m
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(name, _)| ExtensionKind::from_name(name))
            .unwrap_or(ExtensionKind::Unknown)
    }

    pub fn supports(&self, kind: ExtensionKind) -> bool {
        self.id_of(kind).is_some()
    }

    /// The extension handshake message.
    pub fn to_message(&self) -> Result<ExtendedMessage, Error> {
        Ok(ExtendedMessage(HANDSHAKE_ID, self.to_bencode()?))
    }
}

impl TryFrom<&ExtendedMessage> for Extension {
    type Error = Error;

    fn try_from(value: &ExtendedMessage) -> Result<Self, Self::Error> {
        if value.0 != HANDSHAKE_ID {
            return Err(Error::MalformedMessage);
        }
        Ok(Extension::from_bencode(&value.1)?)
    }
}

impl ToBencode for Extension {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair_with(b"m", |e| {
                e.emit_dict(|mut e| {
                    for (name, id) in &self.m {
                        e.emit_pair(name.as_bytes(), id)?;
                    }
                    Ok(())
                })
            })?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(reqq) = self.reqq {
                e.emit_pair(b"reqq", reqq)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            Ok(())
        })
    }
}

fn decode_m(object: Object) -> Result<BTreeMap<String, u8>, bendy::decoding::Error> {
    let mut m = BTreeMap::new();
    let mut dict = object.try_into_dictionary()?;

    while let Some((name, value)) = dict.next_pair()? {
        let id = u8::decode_bencode_object(value).context("m")?;
        if let Ok(name) = String::from_utf8(name.to_vec()) {
            m.insert(name, id);
        }
    }

    Ok(m)
}

impl FromBencode for Extension {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut m = BTreeMap::new();
        let mut v = None;
        let mut reqq = None;
        let mut metadata_size = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => m = decode_m(value).context("m")?,
                (b"metadata_size", value) => {
                    metadata_size = u32::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"reqq", value) => {
                    reqq = u16::decode_bencode_object(value)
                        .context("reqq")
                        .map(Some)?;
                }
                (b"v", value) => {
                    v = String::decode_bencode_object(value)
                        .context("v")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        Ok(Self { m, v, reqq, metadata_size })
    }
}
