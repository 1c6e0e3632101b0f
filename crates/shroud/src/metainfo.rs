//! Metainfo is a .torrent file with information about the Torrent.
//! From the magnet link, we get the Info from other peers.

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{AsString, SingleItemEncoder, ToBencode},
};

use crate::{error::Error, torrent::InfoHash};

/// Metainfo is a .torrent file with information about the Torrent.
#[derive(Debug, PartialEq, Clone)]
pub struct MetaInfo {
    pub announce: Option<String>,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl MetaInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(bytes)?)
    }

    /// Every tracker url, without duplicates, in the order they appear.
    pub fn trackers(&self) -> Vec<String> {
        let mut list: Vec<String> = Vec::new();
        let urls = self
            .announce
            .iter()
            .chain(self.announce_list.iter().flatten().flatten());
        for url in urls {
            if !list.contains(url) {
                list.push(url.clone());
            }
        }
        list
    }
}

/// A file of a multi file torrent, `path` is relative to `Info::name`.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

/// The info dictionary, whose hash identifies the torrent.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    pub name: String,
    pub piece_length: u32,
    /// Concatenated 20 byte SHA-1 hashes, one per piece.
    pub pieces: Vec<u8>,
    /// Single file format.
    pub length: Option<u64>,
    /// Multi file format.
    pub files: Option<Vec<File>>,
    pub private: bool,
    /// The dictionary as it was bencoded, this is what the info hash is
    /// computed from and what is served to peers.
    pub raw: Vec<u8>,
}

impl Info {
    /// Build the info of `data`, hashing every piece.
    pub fn new(
        name: &str,
        piece_length: u32,
        files: Option<Vec<File>>,
        data: &[u8],
    ) -> Result<Self, Error> {
        let mut pieces = Vec::with_capacity(
            data.len().div_ceil(piece_length.max(1) as usize) * 20,
        );
        for chunk in data.chunks(piece_length.max(1) as usize) {
            pieces.extend_from_slice(&sha1_smol::Sha1::from(chunk).digest().bytes());
        }

        let length = match files {
            Some(_) => None,
            None => Some(data.len() as u64),
        };

        let mut info = Self {
            name: name.to_owned(),
            piece_length,
            pieces,
            length,
            files,
            private: false,
            raw: Vec::new(),
        };
        info.raw = info.to_bencode()?;
        Ok(info)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(bytes)?)
    }

    pub fn info_hash(&self) -> InfoHash {
        InfoHash(sha1_smol::Sha1::from(&self.raw).digest().bytes())
    }

    pub fn num_pieces(&self) -> u32 {
        (self.pieces.len() / 20) as u32
    }

    pub fn total_length(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.length.unwrap_or(0),
        }
    }

    /// Length of the piece, the last one may be shorter.
    pub fn piece_size(&self, index: u32) -> Option<u32> {
        if index >= self.num_pieces() {
            return None;
        }
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.total_length());
        Some(end.saturating_sub(begin) as u32)
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8]> {
        let begin = index as usize * 20;
        self.pieces.get(begin..begin + 20)
    }

    /// Each file with its byte offset in the torrent data.
    pub fn file_spans(&self) -> Vec<(String, u64, u64)> {
        match &self.files {
            Some(files) => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|f| {
                        let span = (f.path.join("/"), offset, f.length);
                        offset += f.length;
                        span
                    })
                    .collect()
            }
            None => vec![(self.name.clone(), 0, self.total_length())],
        }
    }
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut length = None;
        let mut path = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"path", value) => {
                    path = Vec::decode_bencode_object(value)
                        .context("path")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let length =
            length.ok_or_else(|| decoding::Error::missing_field("length"))?;
        let path = path.ok_or_else(|| decoding::Error::missing_field("path"))?;

        Ok(File { length, path })
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 10;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(length) = self.length {
                e.emit_pair(b"length", length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))?;
            if self.private {
                e.emit_pair(b"private", 1)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;
        let mut private = false;

        let raw = object.try_into_dictionary()?.into_raw()?;
        let mut decoder = Decoder::new(raw);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    length = u64::decode_bencode_object(value)
                        .context("length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u32::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                (b"private", value) => {
                    private = u8::decode_bencode_object(value)
                        .context("private")?
                        == 1;
                }
                _ => {}
            }
        }

        let name = name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        let info = Info {
            name,
            piece_length,
            pieces,
            length,
            files,
            private,
            raw: raw.to_vec(),
        };

        // one 20 byte hash for every piece of the data
        let expected = if info.piece_length == 0 {
            None
        } else {
            Some(info.total_length().div_ceil(info.piece_length as u64))
        };
        if info.pieces.len() % 20 != 0
            || expected != Some(info.num_pieces() as u64)
        {
            return Err(decoding::Error::unexpected_token(
                format!("{expected:?} piece hashes"),
                format!("{} bytes of hashes", info.pieces.len()),
            )
            .context("pieces"));
        }

        Ok(info)
    }
}

impl ToBencode for MetaInfo {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(announce) = &self.announce {
                e.emit_pair(b"announce", announce)?;
            }
            if let Some(list) = &self.announce_list {
                e.emit_pair(b"announce-list", list)?;
            }
            e.emit_pair(b"info", &self.info)
        })
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let info = info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, announce_list, info })
    }
}
