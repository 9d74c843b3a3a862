//! Byte-range storage of the torrent content, addressed by absolute offset.

use std::{future::Future, io, io::SeekFrom, path::Path};

use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;

use crate::error::Error;

/// Storage of a pre-sized file.
///
/// Only the [`Disk`] task and the startup checks call it, never the
/// reactor.
///
/// [`Disk`]: crate::disk::Disk
pub trait Storage: Send + 'static {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(
        &mut self,
        offset: u64,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Write all of `buf` starting at `offset`.
    fn write_at(
        &mut self,
        offset: u64,
        buf: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Size of the storage in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A regular file on disk.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
    len: u64,
}

impl FileStorage {
    /// Open or create the file at `path` and size it to `len` bytes.
    /// Existing content is kept, it may be a partial download.
    pub async fn open(path: impl AsRef<Path>, len: u64) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await
            .map_err(|_| Error::FileOpenError(path.display().to_string()))?;

        if file.metadata().await?.len() != len {
            debug!("sizing {path:?} to {len} bytes");
            file.set_len(len).await?;
        }

        Ok(Self { file, len })
    }
}

impl Storage for FileStorage {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(buf).await?;
        // tokio finishes the write in the background, errors show up here
        self.file.flush().await
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Content held in memory, used for tests and for seeding generated data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    pub data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(len: u64) -> Self {
        Self { data: vec![0; len as usize] }
    }
}

impl From<Vec<u8>> for MemoryStorage {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Storage for MemoryStorage {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        check_bounds(offset, buf.len(), self.len())?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

fn check_bounds(offset: u64, len: usize, size: u64) -> io::Result<()> {
    if offset.saturating_add(len as u64) > size {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {offset}+{len} is past the end of {size} bytes"),
        ));
    }
    Ok(())
}
