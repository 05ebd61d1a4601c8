//! Block addressed storage of a resource's payload.
//!
//! A [`DataAccess`] only stores bytes. It never checks whether a region it is asked to read was
//! ever written; the owning [`CacheEntry`] is the source of truth for that.

use std::{
    fmt,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use crate::{
    entry::CacheEntry,
    error::{CacheError, CacheResult},
};

/// Length of the `[u32 identity checksum][u32 total size]` header of a data file.
pub const HEADER_LEN: u64 = 8;

#[async_trait]
pub trait DataAccess: Send + Sync + fmt::Debug {
    fn size(&self) -> u64;

    fn block_size(&self) -> u64;

    /// Reads up to `len` bytes starting at `pos`. Fewer bytes are only returned if the underlying
    /// storage ends early.
    async fn read_range(&self, pos: u64, len: usize) -> CacheResult<Bytes>;

    /// Writes a whole block. Only the last block of a resource may be shorter than the block size.
    async fn write_block(&self, block: u64, data: &[u8]) -> CacheResult<()>;

    /// Releases the underlying storage. Any later read or write fails.
    async fn close(&self) -> CacheResult<()>;

    #[allow(clippy::cast_possible_truncation)]
    async fn read_block(&self, block: u64) -> CacheResult<Bytes> {
        let start = block * self.block_size();
        let len = self.size().saturating_sub(start).min(self.block_size());
        self.read_range(start, len as usize).await
    }
}

/// Result of opening the payload storage of a resource.
#[derive(Debug)]
pub struct OpenedDataAccess {
    pub data: Box<dyn DataAccess>,
    /// `false` if the storage did not belong to this resource, or did not exist, and was reset.
    pub resumed: bool,
}

#[async_trait]
pub trait DataAccessFactory: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        block_size: u64,
    ) -> CacheResult<OpenedDataAccess>;
}

/// Opens [`FileDataAccess`] handles.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileDataAccessFactory;

#[async_trait]
impl DataAccessFactory for FileDataAccessFactory {
    async fn open(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        block_size: u64,
    ) -> CacheResult<OpenedDataAccess> {
        let (data, resumed) = FileDataAccess::open(path, key, size, block_size).await?;

        Ok(OpenedDataAccess {
            data: Box::new(data),
            resumed,
        })
    }
}

/// Payload storage in a single file laid out as
/// `[u32 BE identity checksum][u32 BE total size][payload]`.
pub struct FileDataAccess {
    path: PathBuf,
    size: u64,
    block_size: u64,
    file: Mutex<Option<File>>,
}

impl FileDataAccess {
    /// Opens the data file at `path`, creating it if needed.
    ///
    /// If the header does not match the resource, the file is considered not cached at all: it
    /// gets truncated and re-initialized. The returned flag tells whether previous content was
    /// kept.
    #[tracing::instrument(fields(path = format_args!("{}", path.display())), err(Debug))]
    pub async fn open(
        path: &Path,
        key: &str,
        size: u64,
        block_size: u64,
    ) -> CacheResult<(Self, bool)> {
        let header = Self::header(key, size)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let len = file.metadata().await?.len();
        let mut resumed = false;

        if len == HEADER_LEN + size {
            let mut existing = [0; HEADER_LEN as usize];
            file.read_exact(&mut existing).await?;
            resumed = existing == header;
        }

        if resumed {
            tracing::info!("found previously cached data");
        } else {
            if len > 0 {
                tracing::warn!(len, "data file does not belong to this resource, resetting");
            }

            file.set_len(0).await?;
            file.seek(SeekFrom::Start(0)).await?;
            file.write_all(&header).await?;
            file.flush().await?;
            file.set_len(HEADER_LEN + size).await?;
        }

        let data = Self {
            path: path.to_owned(),
            size,
            block_size,
            file: Mutex::new(Some(file)),
        };

        Ok((data, resumed))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identity token of a resource, stored in the data file header.
    pub fn identity_checksum(key: &str) -> u32 {
        let digest = Sha256::digest(key.as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    fn header(key: &str, size: u64) -> CacheResult<[u8; HEADER_LEN as usize]> {
        let size = u32::try_from(size).map_err(|_| CacheError::ResourceTooLarge { size })?;

        let mut header = [0; HEADER_LEN as usize];
        header[..4].copy_from_slice(&Self::identity_checksum(key).to_be_bytes());
        header[4..].copy_from_slice(&size.to_be_bytes());
        Ok(header)
    }

    fn closed(&self) -> CacheError {
        CacheError::Closed(self.path.display().to_string())
    }
}

#[async_trait]
impl DataAccess for FileDataAccess {
    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn read_range(&self, pos: u64, len: usize) -> CacheResult<Bytes> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| self.closed())?;

        file.seek(SeekFrom::Start(HEADER_LEN + pos)).await?;

        let mut buf = BytesMut::zeroed(len);
        let mut total = 0;

        while total < len {
            let count = file.read(&mut buf[total..]).await?;
            if count == 0 {
                break;
            }

            total += count;
        }

        buf.truncate(total);
        Ok(buf.freeze())
    }

    async fn write_block(&self, block: u64, data: &[u8]) -> CacheResult<()> {
        let start = block.saturating_mul(self.block_size);

        if start >= self.size || data.len() as u64 > (self.size - start).min(self.block_size) {
            return Err(CacheError::BlockOutOfRange {
                block,
                block_count: self.size.div_ceil(self.block_size),
            });
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| self.closed())?;

        file.seek(SeekFrom::Start(HEADER_LEN + start)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(path = format_args!("{}", self.path.display())), err(Debug))]
    async fn close(&self) -> CacheResult<()> {
        let Some(file) = self.file.lock().await.take() else {
            return Ok(());
        };

        tracing::info!("closing data file");
        file.sync_all().await?;
        Ok(())
    }
}

impl fmt::Debug for FileDataAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDataAccess")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .finish_non_exhaustive()
    }
}

/// Marks every successfully written block as available in the [`CacheEntry`].
///
/// This is the only path through which availability of an open entry advances.
#[derive(Debug)]
pub struct ReportingDataAccess {
    entry: Arc<CacheEntry>,
    inner: Box<dyn DataAccess>,
}

impl ReportingDataAccess {
    pub fn new(entry: Arc<CacheEntry>, inner: Box<dyn DataAccess>) -> Self {
        Self { entry, inner }
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }
}

#[async_trait]
impl DataAccess for ReportingDataAccess {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn block_size(&self) -> u64 {
        self.inner.block_size()
    }

    async fn read_range(&self, pos: u64, len: usize) -> CacheResult<Bytes> {
        self.inner.read_range(pos, len).await
    }

    async fn write_block(&self, block: u64, data: &[u8]) -> CacheResult<()> {
        self.inner.write_block(block, data).await?;
        self.entry.write(block)
    }

    async fn close(&self) -> CacheResult<()> {
        self.inner.close().await
    }
}
