use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::{Block, BlockInfo};
use crate::{
    bitfield::{self, Bitfield},
    error::Error,
};

/// Frames longer than this are discarded instead of buffered.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Core messages exchanged after a successful handshake.
/// These are from the vanilla protocol, with no extensions.
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
    /// A message with an id we don't know. Its payload was skipped.
    Unknown(u8),
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
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            v => return Err(v),
        })
    }
}

impl MessageId {
    /// Payload length of the messages that have a fixed size.
    fn fixed_payload_len(self) -> Option<usize> {
        use MessageId::*;
        match self {
            Choke | Unchoke | Interested | NotInterested => Some(0),
            Have => Some(4),
            Request | Cancel => Some(12),
            Bitfield | Piece => None,
        }
    }
}

impl Message {
    /// Length of the message on the wire, including the length prefix.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        use Message::*;
        match self {
            KeepAlive => 4,
            Choke | Unchoke | Interested | NotInterested | Unknown(_) => 4 + 1,
            Have(_) => 4 + 1 + 4,
            Cancel(_) | Request(_) => 4 + 1 + 12,
            Bitfield(b) => 4 + 1 + b.len().div_ceil(8),
            Piece(b) => 4 + 1 + 4 + 4 + b.block.len(),
        }
    }
}

/// Resumable framer for the core messages.
///
/// Only complete frames are consumed from the buffer, a partial tail is
/// left untouched until more bytes arrive. A frame larger than
/// `max_frame_len` is dropped, including the bytes of it that have not
/// arrived yet.
#[derive(Debug, Clone)]
pub struct CoreCodec {
    max_frame_len: usize,
    /// Bytes of an oversized frame that still have to be thrown away.
    discarding: usize,
}

impl Default for CoreCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl CoreCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len, discarding: 0 }
    }
}

impl Encoder<Message> for CoreCodec {
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
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have(piece) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece);
            }
            Message::Bitfield(bitfield) => {
                let v = bitfield::to_wire_bytes(&bitfield);
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(info) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Request as u8);
                info.encode(buf);
            }
            Message::Piece(block) => {
                buf.put_u32(1 + 4 + 4 + block.block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                block.encode(buf);
            }
            Message::Cancel(info) => {
                buf.put_u32(1 + 12);
                buf.put_u8(MessageId::Cancel as u8);
                info.encode(buf);
            }
            Message::Unknown(id) => {
                buf.put_u32(1);
                buf.put_u8(id);
            }
        }
        Ok(())
    }
}

impl Decoder for CoreCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discarding > 0 {
                let n = self.discarding.min(buf.len());
                buf.advance(n);
                self.discarding -= n;
                if self.discarding > 0 {
                    return Ok(None);
                }
            }

            // the message length header must be present at the minimum,
            // otherwise we can't determine the message type
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

            if size > self.max_frame_len {
                warn!(
                    "discarding a frame of {size} bytes, larger than {}",
                    self.max_frame_len
                );
                self.discarding = 4 + size;
                continue;
            }

            // incomplete message, the decoder is called again when more
            // bytes arrive, we don't advance the cursor and just wait.
            if buf.len() < 4 + size {
                buf.reserve(4 + size - buf.len());
                return Ok(None);
            }

            // advance past the size, into the msg_id
            buf.advance(4);
            let msg_id = buf.get_u8();
            let payload_len = size - 1;

            let msg_id = match MessageId::try_from(msg_id) {
                Ok(id) => id,
                Err(id) => {
                    // unknown message id, just skip the payload
                    warn!("unknown message_id {id}");
                    buf.advance(payload_len);
                    return Ok(Some(Message::Unknown(id)));
                }
            };

            let malformed = match msg_id.fixed_payload_len() {
                Some(expected) => payload_len != expected,
                None => msg_id == MessageId::Piece && payload_len < 8,
            };

            if malformed {
                buf.advance(payload_len);
                return Err(Error::MalformedFrame {
                    id: msg_id as u8,
                    len: size,
                });
            }

            let msg = match msg_id {
                // <len=0001><id=0>
                MessageId::Choke => Message::Choke,

                // <len=0001><id=1>
                MessageId::Unchoke => Message::Unchoke,

                // <len=0001><id=2>
                MessageId::Interested => Message::Interested,

                // <len=0001><id=3>
                MessageId::NotInterested => Message::NotInterested,

                // <len=0005><id=4><piece index>
                MessageId::Have => Message::Have(buf.get_u32()),

                // <len=0001+X><id=5><bitfield>
                MessageId::Bitfield => {
                    let bytes = buf.split_to(payload_len);
                    Message::Bitfield(Bitfield::from_slice(&bytes))
                }

                // <len=0013><id=6><index><begin><length>
                MessageId::Request => {
                    let index = buf.get_u32();
                    let begin = buf.get_u32();
                    let len = buf.get_u32();
                    Message::Request(BlockInfo { index, begin, len })
                }

                // <len=0009+X><id=7><index><begin><block>
                MessageId::Piece => {
                    let index = buf.get_u32();
                    let begin = buf.get_u32();
                    let block = buf.split_to(payload_len - 8).freeze();
                    Message::Piece(Block { index, begin, block })
                }

                // <len=0013><id=8><index><begin><length>
                MessageId::Cancel => {
                    let index = buf.get_u32();
                    let begin = buf.get_u32();
                    let len = buf.get_u32();
                    Message::Cancel(BlockInfo { index, begin, len })
                }
            };

            return Ok(Some(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp_wire::BLOCK_LEN;
    use bitvec::{bitvec, prelude::Msb0};
    use bytes::Bytes;

    fn encode_all(msgs: &[Message]) -> BytesMut {
        let mut buf = BytesMut::new();
        for msg in msgs {
            CoreCodec::default().encode(msg.clone(), &mut buf).unwrap();
        }
        buf
    }

    fn decode_all(codec: &mut CoreCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    fn sample_stream() -> Vec<Message> {
        // whole bytes, the wire does not carry the bit length
        let mut bitfield = bitvec![u8, Msb0; 0; 16];
        bitfield.set(0, true);
        bitfield.set(9, true);

        vec![
            Message::Bitfield(bitfield),
            Message::KeepAlive,
            Message::Unchoke,
            Message::Interested,
            Message::Have(7),
            Message::Request(BlockInfo::new().index(1).begin(0).len(BLOCK_LEN)),
            Message::Piece(Block {
                index: 1,
                begin: 16384,
                block: Bytes::from(vec![9u8; 300]),
            }),
            Message::Cancel(BlockInfo::new().index(2).begin(32768).len(10)),
            Message::NotInterested,
            Message::Choke,
        ]
    }

    #[test]
    fn fragmented_stream_yields_same_messages() {
        let msgs = sample_stream();
        let stream = encode_all(&msgs);

        let mut codec = CoreCodec::default();
        let mut whole = stream.clone();
        assert_eq!(decode_all(&mut codec, &mut whole), msgs);
        assert!(whole.is_empty());

        // deliver the stream split at every possible single boundary
        for split in 0..=stream.len() {
            let mut codec = CoreCodec::default();
            let mut buf = BytesMut::new();
            let mut decoded = Vec::new();

            buf.extend_from_slice(&stream[..split]);
            decoded.extend(decode_all(&mut codec, &mut buf));
            buf.extend_from_slice(&stream[split..]);
            decoded.extend(decode_all(&mut codec, &mut buf));

            assert_eq!(decoded, msgs, "split at {split}");
            assert!(buf.is_empty());
        }

        // and byte by byte
        let mut codec = CoreCodec::default();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in stream.iter() {
            buf.put_u8(*byte);
            decoded.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn fragmented_piece_message() {
        let mut codec = CoreCodec::default();
        let mut buffer = BytesMut::new();

        let data = vec![0xAA; BLOCK_LEN as usize];
        let total_length = 9 + BLOCK_LEN;

        let mut content = Vec::new();
        content.push(MessageId::Piece as u8);
        content.extend_from_slice(&3u32.to_be_bytes());
        content.extend_from_slice(&0u32.to_be_bytes());
        content.extend_from_slice(&data);

        buffer.extend_from_slice(&total_length.to_be_bytes());
        buffer.extend_from_slice(&content[..1_000]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&content[1_000..10_000]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&content[10_000..]);
        // coalesced with the next messages
        buffer.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        buffer.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x02]);

        match codec.decode(&mut buffer).unwrap().unwrap() {
            Message::Piece(block) => {
                assert_eq!(block.index, 3);
                assert_eq!(block.begin, 0);
                assert_eq!(block.block.len(), BLOCK_LEN as usize);
                assert!(block.block.iter().all(|&b| b == 0xAA));
            }
            _ => panic!("Wrong message type"),
        }

        assert_eq!(codec.decode(&mut buffer).unwrap(), Some(Message::KeepAlive));
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Message::Interested)
        );
        assert!(buffer.is_empty());
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn unknown_message_is_skipped() {
        let mut buf = BytesMut::new();
        // <len=0004><id=20><3 bytes>
        buf.extend_from_slice(&[0, 0, 0, 4, 20, 1, 2, 3]);
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);

        let mut codec = CoreCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unknown(20)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_discarded() {
        let mut codec = CoreCodec::new(64);
        let mut buf = BytesMut::new();

        // a 100 byte piece frame, only half of it arrived
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.put_u8(MessageId::Piece as u8);
        buf.extend_from_slice(&[1u8; 49]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
        assert!(codec.discarding > 0);

        // the rest of it, followed by a valid message
        buf.extend_from_slice(&[1u8; 50]);
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::Interested));
        assert_eq!(codec.discarding, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn wrong_length_is_malformed() {
        let mut codec = CoreCodec::default();

        // a have with 3 bytes of payload
        let mut buf = BytesMut::from(&[0, 0, 0, 4, 4, 0, 0, 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::MalformedFrame { id: 4, len: 4 })
        ));

        // a choke with a payload
        let mut buf = BytesMut::from(&[0, 0, 0, 2, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::MalformedFrame { id: 0, .. })
        ));

        // a piece without begin
        let mut buf = BytesMut::from(&[0, 0, 0, 5, 7, 0, 0, 0, 1][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn bitfield() {
        let mut original = bitvec![u8, Msb0; 0; 10];
        original.set(0, true);
        original.set(8, true);
        original.set(9, true);

        let mut buf = BytesMut::new();
        CoreCodec::default()
            .encode(Message::Bitfield(original.clone()), &mut buf)
            .unwrap();

        // len
        assert_eq!(buf.get_u32(), 1 + 2);
        // msg_id
        assert_eq!(buf.get_u8(), MessageId::Bitfield as u8);
        // MSB first, zero padded
        assert_eq!(&buf[..], &[0b1000_0000, 0b1100_0000]);
    }

    #[test]
    fn request() {
        let mut buf = BytesMut::new();
        let msg = Message::Request(BlockInfo::default());
        CoreCodec::default().encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), 17);
        assert_eq!(buf.len(), msg.len());
        // len
        assert_eq!(buf.get_u32(), 13);
        // id
        assert_eq!(buf.get_u8(), MessageId::Request as u8);
        // index
        assert_eq!(buf.get_u32(), 0);
        // begin
        assert_eq!(buf.get_u32(), 0);
        // len of block
        assert_eq!(buf.get_u32(), BLOCK_LEN);
    }

    #[test]
    fn piece() {
        let mut buf = BytesMut::new();
        let msg = Message::Piece(Block {
            index: 2,
            begin: 16384,
            block: Bytes::from_static(&[7]),
        });
        CoreCodec::default().encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), msg.len());

        // len
        assert_eq!(buf.get_u32(), 9 + 1);
        // id
        assert_eq!(buf.get_u8(), MessageId::Piece as u8);
        // index
        assert_eq!(buf.get_u32(), 2);
        // begin
        assert_eq!(buf.get_u32(), 16384);
        // block
        assert_eq!(&buf[..], &[7]);
    }
}

// Client connections start out as "choked" and "not interested".
//
// A block is downloaded by the client, when the client is interested in a
// peer, and that peer is not choking the client.
//
// A block is uploaded by a client, when the client is not choking a peer,
// and that peer is interested in the client.
//
// c <-handshake-> p
// c <-(optional) bitfield-> p
// c -interested-> p
// c <-unchoke- p
// c <-have- p
// c -request-> p
// ~ download starts here ~
// ~ piece contains a block of data ~
// c <-piece- p
//
// All of the messages in the protocol take the form of
// <length prefix><message ID><payload>. The length prefix is a four byte
// big-endian value, the message ID is a single byte. A length of zero is a
// keep-alive and has no id.
//
// Bitfield <len=0001+X><id=5><bitfield>
// Only ever sent as the first message after the handshake. Byte 0
// corresponds to indices 0-7, from most significant bit to least significant
// bit, byte 1 corresponds to indices 8-15, and so on. Spare bits at the end
// are zero. If a peer doesn't have any pieces, they need not send it.
