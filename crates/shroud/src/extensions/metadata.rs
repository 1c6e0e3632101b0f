//! Types for the Metadata protocol.
//!
//! <http://www.bittorrent.org/beps/bep_0009.html>

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::ToBencode,
};

use crate::error::Error;

/// The info dictionary is exchanged in pieces of this size, the last one
/// may be smaller.
pub const METADATA_PIECE_LEN: usize = 16384;

/// Metadata dict used in the Metadata protocol messages,
/// this dict is used to request, reject, and send data (info).
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    pub total_size: Option<u32>,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl TryFrom<u8> for MetadataMsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MetadataMsgType::*;
        match value {
            v if v == Request as u8 => Ok(Request),
            v if v == Data as u8 => Ok(Data),
            v if v == Reject as u8 => Ok(Reject),
            _ => Err(Error::BencodeError),
        }
    }
}

impl Metadata {
    pub fn request(piece: u32) -> Result<Vec<u8>, Error> {
        let msg = Self { msg_type: MetadataMsgType::Request, piece, total_size: None };
        Ok(msg.to_bencode()?)
    }

    /// The dict followed by the raw `info` slice.
    pub fn data(piece: u32, total_size: u32, info: &[u8]) -> Result<Vec<u8>, Error> {
        let msg = Self {
            msg_type: MetadataMsgType::Data,
            piece,
            total_size: Some(total_size),
        };

        let mut bytes = msg.to_bencode()?;
        bytes.extend_from_slice(info);

        Ok(bytes)
    }

    pub fn reject(piece: u32) -> Result<Vec<u8>, Error> {
        let msg = Self { msg_type: MetadataMsgType::Reject, piece, total_size: None };
        Ok(msg.to_bencode()?)
    }

    /// Split a message into its dict and the trailing payload, which is only
    /// present on data messages.
    pub fn extract(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let mut decoder = Decoder::new(buf);
        let object = decoder.next_object()?.ok_or(Error::BencodeError)?;
        let raw = object.try_into_dictionary()?.into_raw()?;
        let metadata = Metadata::from_bencode(raw)?;

        Ok((metadata, &buf[raw.len()..]))
    }
}

impl FromBencode for Metadata {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut msg_type = None;
        let mut piece = None;
        let mut total_size = None;

        let mut dict_dec = object.try_into_dictionary()?;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"msg_type", value) => {
                    let raw = u8::decode_bencode_object(value).context("msg_type")?;
                    msg_type = MetadataMsgType::try_from(raw).ok();
                }
                (b"piece", value) => {
                    piece = u32::decode_bencode_object(value)
                        .context("piece")
                        .map(Some)?;
                }
                (b"total_size", value) => {
                    total_size = u32::decode_bencode_object(value)
                        .context("total_size")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let msg_type =
            msg_type.ok_or_else(|| decoding::Error::missing_field("msg_type"))?;
        let piece = piece.ok_or_else(|| decoding::Error::missing_field("piece"))?;

        Ok(Self { msg_type, piece, total_size })
    }
}

impl ToBencode for Metadata {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"msg_type", self.msg_type as u8)?;
            e.emit_pair(b"piece", self.piece)?;
            if let Some(total_size) = self.total_size {
                e.emit_pair(b"total_size", total_size)?;
            };
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reject() {
        let bytes = Metadata::request(3).unwrap();
        assert_eq!(bytes, b"d8:msg_typei0e5:piecei3ee");

        let (msg, rest) = Metadata::extract(&bytes).unwrap();
        assert_eq!(msg.msg_type, MetadataMsgType::Request);
        assert_eq!(msg.piece, 3);
        assert!(rest.is_empty());

        let (msg, _) = Metadata::extract(&Metadata::reject(1).unwrap()).unwrap();
        assert_eq!(msg.msg_type, MetadataMsgType::Reject);
    }

    #[test]
    fn data_payload() {
        // the payload may well contain "ee"
        let info = b"d4:name3:fooee".to_vec();
        let bytes = Metadata::data(0, 28258, &info).unwrap();

        let (msg, payload) = Metadata::extract(&bytes).unwrap();
        assert_eq!(msg.msg_type, MetadataMsgType::Data);
        assert_eq!(msg.total_size, Some(28258));
        assert_eq!(payload, &info[..]);
    }

    #[test]
    fn unknown_msg_type() {
        assert!(Metadata::extract(b"d8:msg_typei7e5:piecei0ee").is_err());
    }
}
