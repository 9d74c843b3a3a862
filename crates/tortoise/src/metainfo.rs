//! Parsing of `.torrent` files and the immutable [`Metadata`] the engine
//! runs on.

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::AsString,
};

use crate::{error::Error, torrent::InfoHash};

/// The provided 20-byte digest function used for info hashes and piece
/// verification.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(data);
    hasher.digest().bytes()
}

/// A decoded `.torrent` file.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

/// File related information (Single-file format)
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// piece length - number of bytes in a piece
    pub piece_length: u64,
    /// A (byte) string consisting of the concatenation of all 20-byte SHA1
    /// hash values, one per piece.
    pub pieces: Vec<u8>,
    /// name of the file
    pub name: String,
    /// length - bytes of the entire file
    pub file_length: Option<u64>,
    /// Only present in multi file torrents, which are not supported.
    pub has_files: bool,
    /// SHA-1 of the bencoded info dictionary, exactly as it was in the file.
    pub info_hash: InfoHash,
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut created_by = None;
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
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"created by", value) => {
                    created_by = String::decode_bencode_object(value)
                        .context("created_by")
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

        // trackerless torrents are allowed, peers can come from the cli.
        let announce = announce.unwrap_or_default();
        let info =
            info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, announce_list, info, comment, created_by })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut has_files = false;
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        let bytes = object.try_into_dictionary()?.into_raw()?;
        let info_hash = InfoHash(sha1(bytes));

        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", _) => {
                    has_files = true;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("file.length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = u64::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name =
            name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { piece_length, pieces, name, file_length, has_files, info_hash })
    }
}

impl MetaInfo {
    /// Decode a `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(buf)?)
    }
}

/// Everything the engine needs to know about the torrent. Immutable once
/// built.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub info_hash: InfoHash,
    pub name: String,
    pub announce: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TryFrom<MetaInfo> for Metadata {
    type Error = Error;

    fn try_from(meta: MetaInfo) -> Result<Self, Error> {
        let info = meta.info;

        if info.has_files {
            return Err(Error::MultiFileUnsupported);
        }

        let total_length = info.file_length.ok_or_else(|| {
            Error::MetaInfoInvalid("missing the `length` of the file".into())
        })?;

        let piece_length: u32 = info.piece_length.try_into().map_err(|_| {
            Error::MetaInfoInvalid("piece length is too large".into())
        })?;

        if info.pieces.len() % 20 != 0 {
            return Err(Error::MetaInfoInvalid(
                "`pieces` is not a multiple of 20 bytes".into(),
            ));
        }

        let piece_hashes = info
            .pieces
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let announce = if meta.announce.is_empty() {
            meta.announce_list
                .and_then(|tiers| tiers.into_iter().flatten().next())
                .unwrap_or_default()
        } else {
            meta.announce
        };

        Metadata::new(
            info.info_hash,
            info.name,
            announce,
            piece_length,
            total_length,
            piece_hashes,
        )
    }
}

impl Metadata {
    pub fn new(
        info_hash: InfoHash,
        name: String,
        announce: String,
        piece_length: u32,
        total_length: u64,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<Self, Error> {
        if piece_length == 0 || total_length == 0 {
            return Err(Error::MetaInfoInvalid(
                "the piece length and file length must be positive".into(),
            ));
        }

        let expected = total_length.div_ceil(piece_length as u64);
        if expected != piece_hashes.len() as u64 {
            return Err(Error::MetaInfoInvalid(format!(
                "expected {expected} piece hashes but found {}",
                piece_hashes.len()
            )));
        }

        Ok(Self {
            info_hash,
            name,
            announce,
            piece_length,
            total_length,
            piece_hashes,
        })
    }

    /// Build the metadata of some content we hold in memory, hashing every
    /// piece.
    pub fn from_content(
        name: impl Into<String>,
        announce: impl Into<String>,
        piece_length: u32,
        content: &[u8],
    ) -> Result<Self, Error> {
        let piece_hashes: Vec<[u8; 20]> = content
            .chunks(piece_length.max(1) as usize)
            .map(sha1)
            .collect();

        // the info hash only has to be unique per content here
        let mut seed = Vec::with_capacity(piece_hashes.len() * 20 + 8);
        seed.extend_from_slice(&piece_length.to_be_bytes());
        for h in &piece_hashes {
            seed.extend_from_slice(h);
        }

        Self::new(
            InfoHash(sha1(&seed)),
            name.into(),
            announce.into(),
            piece_length,
            content.len() as u64,
            piece_hashes,
        )
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of the piece, the last one might be shorter.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = self.piece_offset(index);
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    /// Absolute offset of the first byte of the piece.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    pub fn expected_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.piece_hashes.get(index as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent_bytes(info: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce");
        buf.extend_from_slice(b"4:info");
        buf.extend_from_slice(info);
        buf.extend_from_slice(b"e");
        buf
    }

    fn single_file_info(length: u64, piece_length: u32, pieces: usize) -> Vec<u8> {
        let mut info = Vec::new();
        info.extend_from_slice(format!("d6:lengthi{length}e").as_bytes());
        info.extend_from_slice(b"4:name8:file.bin");
        info.extend_from_slice(format!("12:piece lengthi{piece_length}e").as_bytes());
        info.extend_from_slice(format!("6:pieces{}:", pieces * 20).as_bytes());
        info.extend_from_slice(&vec![0xAB; pieces * 20]);
        info.extend_from_slice(b"e");
        info
    }

    #[test]
    fn single_file_torrent() {
        let info = single_file_info(32768, 16384, 2);
        let buf = torrent_bytes(&info);

        let meta = MetaInfo::from_bytes(&buf).unwrap();
        assert_eq!(meta.announce, "http://tracker.example/announce");
        assert_eq!(meta.info.name, "file.bin");
        // the info hash is the hash of the raw info dict
        assert_eq!(meta.info.info_hash, InfoHash(sha1(&info)));

        let meta = Metadata::try_from(meta).unwrap();
        assert_eq!(meta.piece_count(), 2);
        assert_eq!(meta.piece_len(0), 16384);
        assert_eq!(meta.piece_len(1), 16384);
        assert_eq!(meta.piece_offset(1), 16384);
        assert_eq!(meta.expected_hash(1), Some(&[0xAB; 20]));
        assert_eq!(meta.expected_hash(2), None);
    }

    #[test]
    fn shorter_last_piece() {
        let buf = torrent_bytes(&single_file_info(40000, 16384, 3));
        let meta = Metadata::try_from(MetaInfo::from_bytes(&buf).unwrap()).unwrap();
        assert_eq!(meta.piece_len(0), 16384);
        assert_eq!(meta.piece_len(2), 40000 - 2 * 16384);
    }

    #[test]
    fn wrong_amount_of_hashes() {
        let buf = torrent_bytes(&single_file_info(40000, 16384, 2));
        let meta = MetaInfo::from_bytes(&buf).unwrap();
        assert!(matches!(
            Metadata::try_from(meta),
            Err(Error::MetaInfoInvalid(_))
        ));
    }

    #[test]
    fn multi_file_is_rejected() {
        let mut info = Vec::new();
        info.extend_from_slice(b"d5:filesld6:lengthi1e4:pathl1:aeee");
        info.extend_from_slice(b"4:name3:dir12:piece lengthi16384e");
        info.extend_from_slice(b"6:pieces20:");
        info.extend_from_slice(&[0u8; 20]);
        info.extend_from_slice(b"e");

        let meta = MetaInfo::from_bytes(&torrent_bytes(&info)).unwrap();
        assert!(matches!(
            Metadata::try_from(meta),
            Err(Error::MultiFileUnsupported)
        ));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(MetaInfo::from_bytes(b"not bencode").is_err());
    }

    #[test]
    fn from_content() {
        let content = vec![1u8; 40000];
        let meta = Metadata::from_content("a", "", 16384, &content).unwrap();
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.expected_hash(2), Some(&sha1(&content[32768..])));
    }
}
