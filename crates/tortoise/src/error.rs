use std::io;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{disk::DiskMsg, torrent::TorrentMsg};

impl From<bendy::decoding::Error> for Error {
    fn from(value: bendy::decoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(value: bendy::encoding::Error) -> Self {
        Self::BencodeError(value.to_string())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] io::Error),

    #[error("Failed to decode or encode the bencode buffer: {0}")]
    BencodeError(String),

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The info_hash of the handshake does not match ours")]
    InfoHashMismatch,

    #[error("Connected to ourselves, dropping the connection")]
    SelfConnection,

    #[error("The peer violated the protocol: {0}")]
    ProtocolViolation(String),

    #[error("Received a malformed message with id {id} and length {len}")]
    MalformedFrame { id: u8, len: usize },

    #[error(
        "The peer requested a block outside of the piece or of a piece we \
         don't have: index {index} begin {begin} len {len}"
    )]
    RequestOutOfRange { index: u32, begin: u32, len: u32 },

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error(
        "Could not open the file `{0}`. Please make sure the program has \
         permission to access it"
    )]
    FileOpenError(String),

    #[error("The torrent file is invalid: {0}")]
    MetaInfoInvalid(String),

    #[error("Multi-file torrents are not supported")]
    MultiFileUnsupported,

    #[error("The tracker refused the announce: {0}")]
    TrackerFailure(String),

    #[error("The response received from the tracker is not valid")]
    TrackerResponse,

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("HTTP request to the tracker failed: {0}")]
    TrackerHttp(#[from] reqwest::Error),

    #[error("Invalid resume record at line {line}: `{record}`")]
    ResumeRecordInvalid { line: usize, record: String },

    #[error(
        "Seeding requires the whole file, but {missing} pieces failed the \
         hash check"
    )]
    SeedIncomplete { missing: usize },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format: {0}"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),

    #[error("Could not serialize the configuration: {0}")]
    ConfigSerializeError(#[from] toml::ser::Error),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to create dirs."
    )]
    HomeInvalid,

    #[error("Could not send message to Torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),

    #[error("Could not send message to Disk")]
    SendErrorDisk(#[from] mpsc::error::SendError<DiskMsg>),
}

impl Error {
    /// Whether the error only concerns a single connection. The reactor
    /// drops that connection and keeps running.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::SpeedyError(_)
                | Error::HandshakeInvalid
                | Error::InfoHashMismatch
                | Error::SelfConnection
                | Error::ProtocolViolation(_)
                | Error::MalformedFrame { .. }
                | Error::RequestOutOfRange { .. }
                | Error::PeerClosedSocket
                | Error::IO(_)
        )
    }
}
