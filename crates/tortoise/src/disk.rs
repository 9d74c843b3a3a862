//! Disk is responsible for the file I/O of a torrent.
//!
//! The reactor never waits on storage: sessions queue [`DiskMsg`]s and the
//! [`Disk`] task answers with a [`TorrentMsg`] once the work is done.
//! Messages are handled in the order they were sent, so a piece is only
//! hashed after every write of its blocks.

use bytes::Bytes;
use tokio::{sync::mpsc, task::spawn_blocking};
use tracing::{debug, warn};

use crate::{
    error::Error,
    metainfo::{sha1, Metadata},
    peer::ConnId,
    storage::Storage,
    tcp_wire::BlockInfo,
    torrent::TorrentMsg,
};

#[derive(Debug)]
pub enum DiskMsg {
    /// Write piece data at `begin` inside piece `index`. Failures come back
    /// as [`TorrentMsg::WriteFailed`].
    WriteBlock { index: u32, begin: u32, data: Bytes },
    /// Read a block the peer of `conn` asked for, answered with
    /// [`TorrentMsg::BlockRead`].
    ReadBlock { conn: ConnId, info: BlockInfo },
    /// Every block of the piece was written, hash it. Answered with
    /// [`TorrentMsg::PieceChecked`].
    ValidatePiece(u32),
    /// Stop after everything sent before this message is done.
    Quit,
}

/// Handle to a running [`Disk`].
#[derive(Debug, Clone)]
pub struct DiskCtx {
    pub tx: mpsc::UnboundedSender<DiskMsg>,
}

impl DiskCtx {
    /// Queue work for the disk, only fails if the disk task is gone.
    pub fn send(&self, msg: DiskMsg) -> Result<(), Error> {
        Ok(self.tx.send(msg)?)
    }
}

/// Task that owns the storage of a torrent.
pub struct Disk<S: Storage> {
    meta: Metadata,
    pub storage: S,
    rx: mpsc::UnboundedReceiver<DiskMsg>,
}

impl<S: Storage> Disk<S> {
    pub fn new(meta: Metadata, storage: S) -> (Self, DiskCtx) {
        let (tx, rx) = mpsc::unbounded_channel::<DiskMsg>();
        (Self { meta, storage, rx }, DiskCtx { tx })
    }

    /// Handle messages until [`DiskMsg::Quit`], or until every
    /// [`DiskCtx`] is dropped. Answers that the torrent can't take anymore
    /// are dropped, the writes still happen.
    #[tracing::instrument(name = "disk", skip_all)]
    pub async fn run(mut self, torrent: mpsc::Sender<TorrentMsg>) {
        debug!("disk started event loop");

        while let Some(msg) = self.rx.recv().await {
            if let DiskMsg::Quit = msg {
                break;
            }
            if let Some(reply) = self.handle(msg).await {
                if torrent.send(reply).await.is_err() {
                    debug!("torrent is gone, dropping a disk answer");
                }
            }
        }

        debug!("disk stopped");
    }

    /// Do the work of one message, and return the answer for the torrent
    /// if it expects one.
    pub async fn handle(&mut self, msg: DiskMsg) -> Option<TorrentMsg> {
        match msg {
            DiskMsg::WriteBlock { index, begin, data } => {
                let offset = self.meta.piece_offset(index) + begin as u64;
                match self.storage.write_at(offset, &data).await {
                    Ok(()) => None,
                    Err(error) => {
                        warn!("could not write {} bytes at {offset}: {error}", data.len());
                        Some(TorrentMsg::WriteFailed { index, begin, error })
                    }
                }
            }
            DiskMsg::ReadBlock { conn, info } => {
                let offset = self.meta.piece_offset(info.index) + info.begin as u64;
                let mut buf = vec![0u8; info.len as usize];

                let data = match self.storage.read_at(offset, &mut buf).await {
                    Ok(()) => Some(Bytes::from(buf)),
                    Err(e) => {
                        warn!("could not read {info:?} to upload it: {e}");
                        None
                    }
                };
                Some(TorrentMsg::BlockRead { conn, info, data })
            }
            DiskMsg::ValidatePiece(index) => {
                let valid = piece_matches(&self.meta, &mut self.storage, index).await;
                Some(TorrentMsg::PieceChecked { index, valid })
            }
            DiskMsg::Quit => None,
        }
    }
}

/// Whether the piece in storage hashes to its expected value. A read error
/// counts as a mismatch.
///
/// Hashing runs on the blocking pool, pieces can be several megabytes.
pub async fn piece_matches<S: Storage>(
    meta: &Metadata,
    storage: &mut S,
    index: u32,
) -> bool {
    let Some(expected) = meta.expected_hash(index).copied() else {
        return false;
    };

    let mut buf = vec![0u8; meta.piece_len(index) as usize];
    if let Err(e) = storage.read_at(meta.piece_offset(index), &mut buf).await {
        warn!("could not read piece {index} to verify it: {e}");
        return false;
    }

    match spawn_blocking(move || sha1(&buf)).await {
        Ok(hash) => hash == expected,
        Err(e) => {
            warn!("hashing piece {index} failed: {e}");
            false
        }
    }
}
