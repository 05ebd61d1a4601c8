use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use tokio::time::Instant;

use crate::{
    data_access::DataAccess,
    entry::CacheEntry,
    error::{CacheError, CacheResult},
    holder::CacheEntryHolder,
    manager::ManagerInner,
};

/// Read handle over a cached resource that may still be transferring.
///
/// Reads of bytes that are not on disk yet wait for the background transfer, starting it if
/// needed. Every reader holds a reference to the entry; cloning a reader adds one, dropping it
/// releases it. Once the last reader is gone the transfer stops and the entry may leave memory.
pub struct CacheReader {
    holder: Arc<CacheEntryHolder>,
    manager: Weak<ManagerInner>,
    position: u64,
    poll_interval: Duration,
    idle_timeout: Duration,
}

impl CacheReader {
    /// Wraps a holder on which a reference was already taken.
    pub(crate) fn new(
        holder: Arc<CacheEntryHolder>,
        manager: Weak<ManagerInner>,
        poll_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            holder,
            manager,
            position: 0,
            poll_interval,
            idle_timeout,
        }
    }

    pub fn key(&self) -> &str {
        self.holder.entry().key()
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        self.holder.entry()
    }

    pub fn total_size(&self) -> u64 {
        self.holder.entry().size()
    }

    /// How much of the resource is cached, between 0 and 1. `None` if there is nothing to
    /// estimate, i.e. the resource is empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_cached(&self) -> Option<f64> {
        let entry = self.holder.entry();

        match entry.size() {
            0 => None,
            size => Some(entry.available_len() as f64 / size as f64),
        }
    }

    /// Number of bytes that can be read starting at `position` without waiting.
    pub fn available_from(&self, position: u64) -> u64 {
        self.holder.entry().contiguous_len().saturating_sub(position)
    }

    pub fn is_transferring(&self) -> bool {
        self.holder.is_transferring()
    }

    /// Reads up to `len` bytes at `pos`, waiting until they are cached.
    ///
    /// Returns `None` if `pos` is at or past the end of the resource. Otherwise `len` is clamped
    /// to the end of the resource and exactly that many bytes are returned.
    #[tracing::instrument(skip(self), fields(key = self.key()), err(Debug))]
    pub async fn read(&self, pos: u64, len: usize) -> CacheResult<Option<Bytes>> {
        let size = self.total_size();

        if pos >= size {
            return Ok(None);
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = (len as u64).min(size - pos) as usize;
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        self.wait_cached(pos + len as u64).await?;

        let bytes = self.holder.data().read_range(pos, len).await?;

        if bytes.len() != len {
            let error = CacheError::ShortRead {
                pos,
                expected: len,
                actual: bytes.len(),
            };

            tracing::error!(entry = ?self.holder.entry(), "{error}");
            return Err(error);
        }

        Ok(Some(bytes))
    }

    /// Reads up to `len` bytes at the cursor and advances it.
    pub async fn read_next(&mut self, len: usize) -> CacheResult<Option<Bytes>> {
        let bytes = self.read(self.position, len).await?;

        if let Some(bytes) = &bytes {
            self.position += bytes.len() as u64;
        }

        Ok(bytes)
    }

    /// Moves the cursor, clamped to the end of the resource.
    pub fn seek(&mut self, position: u64) -> u64 {
        self.position = position.min(self.total_size());
        self.position
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Releases this reader. Equivalent to dropping it.
    pub fn close(self) {}

    /// Waits until the first `end` bytes are cached.
    ///
    /// Re-checks at least every poll interval. A transfer that produced nothing for the idle
    /// timeout is restarted.
    async fn wait_cached(&self, end: u64) -> CacheResult<()> {
        let entry = self.holder.entry();
        let mut last_seen = entry.contiguous_len();
        let mut last_progress = Instant::now();

        loop {
            // Register for wake-ups before checking, so a write in between is not missed.
            let notified = entry.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let written = entry.contiguous_len();
            if written >= end {
                return Ok(());
            }

            if written != last_seen {
                last_seen = written;
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= self.idle_timeout && self.holder.is_transferring()
            {
                last_progress = Instant::now();
                self.holder.restart_transfer()?;
            }

            self.holder.ensure_transfer()?;

            // Timing out only means it is time to re-check.
            let _ = tokio::time::timeout(self.poll_interval, notified).await;
        }
    }
}

impl Clone for CacheReader {
    fn clone(&self) -> Self {
        self.holder.retain();

        Self {
            holder: self.holder.clone(),
            manager: self.manager.clone(),
            position: self.position,
            poll_interval: self.poll_interval,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl Drop for CacheReader {
    fn drop(&mut self) {
        match self.manager.upgrade() {
            Some(manager) => manager.release(&self.holder),
            None => {
                if self.holder.release() == 0 {
                    self.holder.stop_transfer();
                }
            }
        }
    }
}

impl fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheReader")
            .field("entry", self.holder.entry())
            .field("position", &self.position)
            .field("refs", &self.holder.refs())
            .finish_non_exhaustive()
    }
}
