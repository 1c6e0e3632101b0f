//! Handle magnet link
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, torrent::InfoHash};

#[derive(Debug, Clone)]
pub struct Magnet(pub Magnet_);

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Magnet {
    /// Parse a magnet uri, it must carry a `urn:btih:` exact topic.
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        if !magnet_url.contains("xt=urn:btih:") {
            return Err(Error::MagnetNoInfoHash);
        }

        let magnet = Self(Magnet_::new(magnet_url)?);
        magnet.info_hash()?;
        Ok(magnet)
    }

    /// The name will come URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> String {
        if let Some(dn) = &self.0.dn {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.replace('+', " ");
            }
        }
        "Unknown".to_owned()
    }

    /// Transform the "xt" field from hex.
    pub fn info_hash(&self) -> Result<InfoHash, Error> {
        let xt = self.0.xt.as_deref().ok_or(Error::MagnetNoInfoHash)?;
        if xt.len() != 40 {
            return Err(Error::MagnetNoInfoHash);
        }
        xt.parse()
    }

    /// Tracker urls, decoded.
    pub fn trackers(&self) -> Vec<String> {
        self.0
            .tr
            .iter()
            .map(|tr| {
                urlencoding::decode(tr)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| tr.clone())
            })
            .collect()
    }
}
