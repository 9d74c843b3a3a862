//! Codec for encoding and decoding handshakes.
//!
//! This has to be a separate codec as the handshake has a different
//! structure than the rest of the messages. Moreover, handshakes may only
//! be sent once at the beginning of a connection, preceding all other
//! messages. After the handshake the session switches to [`CoreCodec`]
//! over the same read buffer, so bytes that arrived right after the
//! handshake are not lost.
//!
//! [`CoreCodec`]: super::CoreCodec

use bytes::BytesMut;
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::PSTR;
use crate::{error::Error, peer::PeerId, torrent::InfoHash};

#[derive(Debug, Default, Clone, Copy)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<(), Error> {
        // we should only be sending the bittorrent protocol string
        debug_assert_eq!(handshake.pstr_len, 19);
        debug_assert_eq!(handshake.pstr, PSTR);

        buf.extend_from_slice(&handshake.serialize()?);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        // peek at the protocol length, we are not sure yet that the full
        // message is in the buffer.
        let Some(&prot_len) = buf.first() else {
            return Ok(None);
        };
        if prot_len as usize != PSTR.len() {
            warn!("! handshake with wrong pstr_len {prot_len}");
            return Err(Error::HandshakeInvalid);
        }

        if buf.len() < Handshake::LEN {
            return Ok(None);
        }

        let handshake = Handshake::deserialize(&buf.split_to(Handshake::LEN))?;

        if handshake.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return Err(Error::HandshakeInvalid);
        }

        Ok(Some(handshake))
    }
}

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// or the info hash differs from ours, the connection is severed. The
/// reserved field is 8 zero bytes, we don't advertise any extension.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// `1 + 19 + 8 + 20 + 20`
    pub const LEN: usize = 68;

    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            pstr_len: 19,
            pstr: PSTR,
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; 68], Error> {
        let mut buf = [0u8; Self::LEN];
        let temp = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&temp[..]);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Validate the handshake received from a peer against the torrent we
    /// are serving.
    pub fn validate(&self, info_hash: &InfoHash) -> Result<(), Error> {
        if self.pstr_len != 19 || self.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return Err(Error::HandshakeInvalid);
        }
        if self.info_hash != *info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return Err(Error::InfoHashMismatch);
        }
        Ok(())
    }
}
