use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::warn;

use crate::error::Error;

/// How many connections a torrent keeps at most.
pub const DEFAULT_MAX_PEERS: usize = 50;

/// How many blocks may be in flight on a single connection.
pub const DEFAULT_PIECE_WINDOW: usize = 48;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Maximum number of connections per torrent.
    pub max_peers: usize,
    /// Maximum number of in flight block requests per connection.
    pub piece_window: usize,
    /// Maximum number of torrents active at once, 0 means no limit.
    pub queue_size: usize,
    /// Send peer exchange messages on public torrents.
    pub pex: bool,
    pub handshake_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            piece_window: DEFAULT_PIECE_WINDOW,
            queue_size: 0,
            pex: true,
            handshake_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Path of the configuration file, creating its folder if needed.
    ///
    /// # Errors
    ///
    /// Fails if the user has no home folder, or the program can't create
    /// the config folder.
    pub async fn config_path() -> Result<PathBuf, Error> {
        let dotfile =
            ProjectDirs::from("", "", "Shroud").ok_or(Error::HomeInvalid)?;
        let mut config_path = dotfile.config_dir().to_path_buf();

        if !config_path.exists() {
            create_dir_all(&config_path).await?;
        }

        config_path.push("config.toml");
        Ok(config_path)
    }

    /// Load the configuration file and transform it into Self.
    /// If the file does not exist or can't be parsed, it is replaced
    /// with the default configuration.
    pub async fn load() -> Result<Self, Error> {
        let path = Self::config_path().await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut dst = String::new();
        file.read_to_string(&mut dst).await?;

        match toml::from_str::<Config>(&dst) {
            Ok(config) => Ok(config),
            Err(e) => {
                if !dst.is_empty() {
                    warn!("invalid config at {path:?}, writing defaults: {e}");
                }
                let config = Config::default();
                let config_str = toml::to_string(&config)
                    .map_err(|_| Error::ConfigDeserializeError)?;

                let mut file = OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .await?;
                file.write_all(config_str.as_bytes()).await?;

                Ok(config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: Config = toml::from_str("max_peers = 10").unwrap();
        assert_eq!(config.max_peers, 10);
        assert_eq!(config.piece_window, DEFAULT_PIECE_WINDOW);
        assert!(config.pex);

        let s = toml::to_string(&Config::default()).unwrap();
        assert_eq!(toml::from_str::<Config>(&s).unwrap(), Config::default());
    }
}
