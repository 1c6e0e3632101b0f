use std::io;

use thiserror::Error;

use crate::torrent::InfoHash;

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<magnet_url::MagnetError> for Error {
    fn from(value: magnet_url::MagnetError) -> Self {
        Self::MagnetError(value)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("Error when reading magnet link")]
    MagnetError(magnet_url::MagnetError),

    #[error(
        "Your magnet does not have an info_hash, are you sure you copied the \
         entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error("The info hash is not 20 bytes of hex")]
    InfoHashInvalid,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took to long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer handshake is for a different torrent")]
    InfoHashMismatch,

    #[error("The peer sent a malformed message")]
    MalformedMessage,

    #[error("The peer requested a block we do not serve")]
    RequestInvalid,

    #[error("The connection is closed")]
    ConnectionClosed,

    #[error("Torrent already started")]
    AlreadyStarted,

    #[error("Torrent already stopped")]
    AlreadyStopped,

    #[error("Could not find torrent for the given info_hash")]
    TorrentDoesNotExist,

    #[error("Torrent {0} is already added")]
    NoDuplicateTorrent(InfoHash),

    #[error("The torrent is not accepting new peers")]
    PeerRejected,

    #[error("There is no network session")]
    NoNetwork,

    #[error("The network session was closed")]
    NetworkClosed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("The piece downloaded does not have a valid hash")]
    PieceInvalid,

    #[error("The metadata does not hash to the info hash")]
    MetadataRejected,

    #[error("The advertised metadata is too large")]
    MetadataTooLarge,

    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Torrents from `{0}` are not supported")]
    UnsupportedSource(String),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError,
}
