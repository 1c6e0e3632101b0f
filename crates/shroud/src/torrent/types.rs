use std::{fmt::Display, ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};
use speedy::{Readable, Writable};

use crate::error::Error;

/// SHA-1 of the bencoded info dictionary, identifies a torrent.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn random() -> Self {
        InfoHash(rand::random())
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = Error;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let buff: [u8; 20] =
            value.try_into().map_err(|_| Error::InfoHashInvalid)?;
        Ok(InfoHash(buff))
    }
}

impl FromStr for InfoHash {
    type Err = Error;

    /// Parse the 40 character hex form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buff = hex::decode(s).map_err(|_| Error::InfoHashInvalid)?;
        InfoHash::try_from(buff)
    }
}

/// State of a torrent as seen by the management layer.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TorrentState {
    /// Storage is running a full verification pass.
    Checking,
    Downloading,
    Seeding,
    #[default]
    Stopped,
}

impl Display for TorrentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Seeding => "seeding",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_hex() {
        let hex = "2b66980093bc11806fab50cb3cb41835b95a0362";
        let info_hash: InfoHash = hex.parse().unwrap();
        assert_eq!(info_hash.to_string(), hex);
        assert_eq!(format!("{info_hash:?}"), "2b66980093");

        assert!("2b66".parse::<InfoHash>().is_err());
        assert!("zz".repeat(20).parse::<InfoHash>().is_err());
    }
}
