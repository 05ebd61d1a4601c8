use std::{
    fmt,
    sync::{Arc, Mutex, RwLock},
};

use rangemap::RangeSet;
use tokio::sync::{futures::Notified, Notify};

use crate::error::{CacheError, CacheResult};

/// Gets informed after a block of a [`CacheEntry`] has been marked as available.
///
/// Listeners are invoked outside of the entry's lock, so they may freely query the entry.
pub trait WriteListener: Send + Sync {
    fn on_write(&self, entry: &Arc<CacheEntry>, block: u64);
}

/// In-memory record of a cached resource: its identity, its size and the blocks of it that are
/// present on disk.
///
/// Availability only ever grows. Once a block is marked, it stays marked for the lifetime of the
/// entry.
pub struct CacheEntry {
    key: String,
    size: u64,
    block_size: u64,
    state: Mutex<Availability>,
    // Copy-on-write: notification iterates a snapshot while (un)subscribing swaps the list.
    listeners: RwLock<Arc<[Arc<dyn WriteListener>]>>,
    written: Notify,
}

#[derive(Debug, Default)]
struct Availability {
    blocks: RangeSet<u64>,
    /// Index of the first block that is not available yet.
    first_missing: u64,
}

impl CacheEntry {
    /// Creates a new and empty cache entry.
    pub fn new(key: impl Into<String>, size: u64, block_size: u64) -> Self {
        Self {
            key: key.into(),
            size,
            block_size,
            state: Mutex::new(Availability::default()),
            listeners: RwLock::new(Vec::new().into()),
            written: Notify::new(),
        }
    }

    /// Creates a cache entry with the given blocks already available.
    pub fn with_available(
        key: impl Into<String>,
        size: u64,
        block_size: u64,
        blocks: RangeSet<u64>,
    ) -> CacheResult<Self> {
        let mut entry = Self::new(key, size, block_size);

        if let Some(last) = blocks.iter().last() {
            entry.check_block_index(last.end - 1)?;
        }

        let first_missing = blocks
            .iter()
            .next()
            .filter(|r| r.start == 0)
            .map_or(0, |r| r.end);

        entry.state = Mutex::new(Availability {
            blocks,
            first_missing,
        });

        Ok(entry)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u64 {
        self.size.div_ceil(self.block_size)
    }

    /// Returns the index of the block holding the byte at `position`.
    pub fn block_index(&self, position: u64) -> u64 {
        position / self.block_size
    }

    /// Length in bytes of the given block; only the last block can be shorter than the block size.
    pub fn block_len(&self, block: u64) -> u64 {
        let start = block * self.block_size;
        self.size.saturating_sub(start).min(self.block_size)
    }

    /// Marks the given block as written and informs the subscribed listeners.
    ///
    /// Marking a block twice is harmless.
    #[allow(clippy::missing_panics_doc)]
    pub fn write(self: &Arc<Self>, block: u64) -> CacheResult<()> {
        self.check_block_index(block)?;

        {
            let mut state = self.state.lock().unwrap();
            state.blocks.insert(block..block + 1);

            if block == state.first_missing {
                // Adjacent ranges are coalesced, so the range holding `block` ends at the next gap.
                state.first_missing = state.blocks.get(&block).map_or(block + 1, |r| r.end);
            }
        }

        let listeners = self.listeners.read().unwrap().clone();
        for listener in listeners.iter() {
            listener.on_write(self, block);
        }

        self.written.notify_waiters();

        Ok(())
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn has(&self, block: u64) -> bool {
        self.state.lock().unwrap().blocks.contains(&block)
    }

    /// Returns a copy of the set of blocks that are currently available.
    #[allow(clippy::missing_panics_doc)]
    pub fn available_snapshot(&self) -> RangeSet<u64> {
        self.state.lock().unwrap().blocks.clone()
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn is_fully_available(&self) -> bool {
        self.state.lock().unwrap().first_missing >= self.block_count()
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn first_missing_block(&self) -> u64 {
        self.state.lock().unwrap().first_missing
    }

    /// Number of bytes available without a gap, starting at offset 0.
    pub fn contiguous_len(&self) -> u64 {
        (self.first_missing_block() * self.block_size).min(self.size)
    }

    /// Total number of bytes available, gaps notwithstanding.
    #[allow(clippy::missing_panics_doc)]
    pub fn available_len(&self) -> u64 {
        let state = self.state.lock().unwrap();

        state
            .blocks
            .iter()
            .map(|r| (r.end * self.block_size).min(self.size) - r.start * self.block_size)
            .sum()
    }

    /// Subscribes the listener to react to writes on this entry.
    #[allow(clippy::missing_panics_doc)]
    pub fn subscribe(&self, listener: Arc<dyn WriteListener>) {
        let mut listeners = self.listeners.write().unwrap();

        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return;
        }

        let mut updated = listeners.to_vec();
        updated.push(listener);
        *listeners = updated.into();
    }

    /// Unsubscribes the given listener from this cache entry.
    #[allow(clippy::missing_panics_doc)]
    pub fn unsubscribe(&self, listener: &Arc<dyn WriteListener>) {
        let mut listeners = self.listeners.write().unwrap();

        let updated: Vec<_> = listeners
            .iter()
            .filter(|l| !same_listener(l, listener))
            .cloned()
            .collect();

        *listeners = updated.into();
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().unwrap().len()
    }

    /// Future resolving on the next write to this entry or on [`CacheEntry::wake_waiters`].
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.written.notified()
    }

    /// Wakes up readers waiting for data, e.g. after the transfer stopped.
    pub(crate) fn wake_waiters(&self) {
        self.written.notify_waiters();
    }

    fn check_block_index(&self, block: u64) -> CacheResult<()> {
        if block.saturating_mul(self.block_size) >= self.size {
            return Err(CacheError::BlockOutOfRange {
                block,
                block_count: self.block_count(),
            });
        }

        Ok(())
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .field("first_missing", &self.first_missing_block())
            .finish_non_exhaustive()
    }
}

fn same_listener(a: &Arc<dyn WriteListener>, b: &Arc<dyn WriteListener>) -> bool {
    // Compare data pointers only; vtable pointers of the same type may differ between codegen units.
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
