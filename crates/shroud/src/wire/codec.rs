use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo, MAX_FRAME_SIZE};
use crate::{bitfield::Bitfield, error::Error};

/// The first value is decided when the peer sends its extension header, in the
/// m field. Zero is the extension handshake itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

impl From<ExtendedMessage> for Message {
    fn from(value: ExtendedMessage) -> Self {
        Self::Extended(value)
    }
}

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Extended(ExtendedMessage),
}

impl Message {
    /// Size of the encoded frame, including the length prefix.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        use Message::*;
        match self {
            KeepAlive => 4,
            Choke | Unchoke | Interested | NotInterested => 4 + 1,
            Have(_) => 4 + 1 + 4,
            Bitfield(b) => 4 + 1 + b.as_raw_slice().len(),
            Cancel(_) | Request(_) => 4 + 1 + 4 + 4 + 4,
            Piece(b) => 4 + 1 + 4 + 4 + b.block.len(),
            Extended(m) => 4 + 1 + 1 + m.1.len(),
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        use Message::*;
        Some(match self {
            KeepAlive => return None,
            Choke => MessageId::Choke,
            Unchoke => MessageId::Unchoke,
            Interested => MessageId::Interested,
            NotInterested => MessageId::NotInterested,
            Have(_) => MessageId::Have,
            Bitfield(_) => MessageId::Bitfield,
            Request(_) => MessageId::Request,
            Piece(_) => MessageId::Piece,
            Cancel(_) => MessageId::Cancel,
            Extended(_) => MessageId::Extended,
        })
    }
}

/// The IDs of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match k {
            k if k == Choke as u8 => Ok(Choke),
            k if k == Unchoke as u8 => Ok(Unchoke),
            k if k == Interested as u8 => Ok(Interested),
            k if k == NotInterested as u8 => Ok(NotInterested),
            k if k == Have as u8 => Ok(Have),
            k if k == Bitfield as u8 => Ok(Bitfield),
            k if k == Request as u8 => Ok(Request),
            k if k == Piece as u8 => Ok(Piece),
            k if k == Cancel as u8 => Ok(Cancel),
            k if k == Extended as u8 => Ok(Extended),
            _ => Err(Error::MalformedMessage),
        }
    }
}

/// Frames are `<length u32><id u8><payload>`.
///
/// Frames longer than [`MAX_FRAME_SIZE`] are skipped as they stream in,
/// the decoder only remembers how many bytes it still has to throw away.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    discard: usize,
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(item.len());

        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.put_u32(1);
                if let Some(id) = item.id() {
                    buf.put_u8(id as u8);
                }
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(mut bitfield) => {
                bitfield.set_uninitialized(false);
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(Block { index, begin, block }) => {
                buf.put_u32(1 + 4 + 4 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.extend_from_slice(&block);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                info.encode(buf);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Message::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn block_info(payload: &mut BytesMut) -> Result<BlockInfo, Error> {
    if payload.len() != 4 + 4 + 4 {
        return Err(Error::MalformedMessage);
    }
    Ok(BlockInfo {
        index: payload.get_u32(),
        begin: payload.get_u32(),
        len: payload.get_u32(),
    })
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discard > 0 {
                let n = self.discard.min(buf.len());
                buf.advance(n);
                self.discard -= n;
                if self.discard > 0 {
                    return Ok(None);
                }
            }

            if buf.len() < 4 {
                return Ok(None);
            }

            // peek at length prefix without consuming
            let size =
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

            if size == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            if size > MAX_FRAME_SIZE {
                warn!("discarding frame of {size} bytes");
                buf.advance(4);
                self.discard = size;
                continue;
            }

            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let msg_id = buf.get_u8();
            let mut payload = buf.split_to(size - 1);

            let Ok(msg_id) = MessageId::try_from(msg_id) else {
                // unknown message id, the segment is already skipped
                warn!("unknown message_id {msg_id:?}");
                continue;
            };

            let msg = match msg_id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    if payload.len() != 4 {
                        return Err(Error::MalformedMessage);
                    }
                    Message::Have(payload.get_u32())
                }
                MessageId::Bitfield => {
                    Message::Bitfield(Bitfield::from_vec(payload.to_vec()))
                }
                MessageId::Request => Message::Request(block_info(&mut payload)?),
                MessageId::Cancel => Message::Cancel(block_info(&mut payload)?),
                MessageId::Piece => {
                    if payload.len() <= 4 + 4 {
                        return Err(Error::MalformedMessage);
                    }
                    let index = payload.get_u32();
                    let begin = payload.get_u32();
                    Message::Piece(Block { index, begin, block: payload.to_vec() })
                }
                MessageId::Extended => {
                    if payload.is_empty() {
                        return Err(Error::MalformedMessage);
                    }
                    let ext_id = payload.get_u8();
                    Message::Extended(ExtendedMessage(ext_id, payload.to_vec()))
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitfield::BitfieldExt, wire::BLOCK_LEN};

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec::default().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn request() {
        let info = BlockInfo::new().index(1).begin(BLOCK_LEN).len(BLOCK_LEN);
        let msg = Message::Request(info);
        let buf = encode(msg.clone());

        assert_eq!(buf.len(), msg.len());
        assert_eq!(
            &buf[..],
            &[0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]
        );

        let mut buf = buf;
        let decoded = MessageCodec::default().decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn bitfield_padding_is_zero() {
        let mut bitfield = Bitfield::from_bytes(&[0xff, 0xff], 10);
        bitfield.safe_set(9);
        let buf = encode(Message::Bitfield(bitfield));
        assert_eq!(&buf[..], &[0, 0, 0, 3, 5, 0xff, 0b1100_0000]);
    }

    #[test]
    fn fragmented_piece() {
        let mut codec = MessageCodec::default();
        let block = Block { index: 2, begin: 0, block: vec![0xAA; 5000] };
        let full = encode(Message::Piece(block.clone()));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..1000]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[1000..]);

        // keepalive and interested right behind it
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1, 2]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Piece(block)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::KeepAlive));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Interested));
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_discarded() {
        let mut codec = MessageCodec::default();
        let size = MAX_FRAME_SIZE + 100;

        let mut buf = BytesMut::new();
        buf.put_u32(size as u32);
        buf.put_u8(MessageId::Extended as u8);
        buf.extend_from_slice(&vec![1u8; 2000]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());

        // the rest of the junk frame, followed by a real message
        buf.extend_from_slice(&vec![1u8; size - 1 - 2000]);
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 9]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Have(9)));
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_id_is_skipped() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 3, 99, 1, 2]);
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Choke));
    }

    #[test]
    fn malformed_payloads() {
        let mut codec = MessageCodec::default();

        let mut buf = BytesMut::from(&[0, 0, 0, 3, 4, 0, 0][..]);
        assert!(codec.decode(&mut buf).is_err());

        // request must be exactly 12 bytes
        let mut buf = BytesMut::from(&[0, 0, 0, 5, 6, 0, 0, 0, 1][..]);
        assert!(codec.decode(&mut buf).is_err());

        // piece without data
        let mut buf = BytesMut::from(&[0, 0, 0, 9, 7, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn extended() {
        let msg: Message = ExtendedMessage(3, b"d1:xi1ee".to_vec()).into();
        let mut buf = encode(msg.clone());
        assert_eq!(&buf[..6], &[0, 0, 0, 10, 20, 3]);
        assert_eq!(MessageCodec::default().decode(&mut buf).unwrap(), Some(msg));
    }
}
