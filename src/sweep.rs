//! Size and age bounded eviction of cached files.

use std::{
    collections::{HashMap, HashSet},
    ffi::OsStr,
    time::SystemTime,
};

use crate::{
    data_access::DataAccess,
    error::CacheResult,
    manager::{CacheManager, ManagerInner},
};

/// Outcome of an eviction run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Bytes kept on disk, including entries that were skipped.
    pub kept_bytes: u64,
    /// Entries whose files got deleted.
    pub deleted: usize,
    /// Entries that should have been deleted but were still referenced.
    pub skipped: usize,
}

/// Files sharing one slug.
#[derive(Debug)]
struct DiskEntry {
    slug: String,
    size: u64,
    modified: SystemTime,
}

impl CacheManager {
    /// Deletes the least recently used entries until the files in the cache root take up at most
    /// `max_size` bytes. Entries that are still referenced are never deleted.
    pub async fn sweep(&self, max_size: u64) -> CacheResult<SweepStats> {
        self.inner().sweep(max_size).await
    }

    /// Deletes every unreferenced entry last used before `threshold`.
    pub async fn delete_before(&self, threshold: SystemTime) -> CacheResult<SweepStats> {
        self.inner().delete_before(threshold).await
    }
}

impl ManagerInner {
    #[tracing::instrument(skip(self), err(Debug))]
    pub(crate) async fn sweep(&self, max_size: u64) -> CacheResult<SweepStats> {
        let _guard = self.open_lock.lock().await;

        let (entries, referenced) = self.list_entries().await?;
        let total: u64 = entries.iter().map(|e| e.size).sum();

        tracing::debug!(
            files = entries.len(),
            used = total,
            max_size,
            "doing cache cleanup"
        );

        let mut stats = SweepStats::default();
        // Covers evicted entries too: once over the ceiling, every older entry goes.
        let mut running = 0u64;

        for entry in entries {
            running = running.saturating_add(entry.size);

            if running <= max_size {
                stats.kept_bytes += entry.size;
            } else if referenced.contains(&entry.slug) {
                tracing::debug!(slug = %entry.slug, "entry is in use, not deleting it");
                stats.kept_bytes += entry.size;
                stats.skipped += 1;
            } else if self.evict(&entry.slug).await? {
                stats.deleted += 1;
            } else {
                stats.kept_bytes += entry.size;
                stats.skipped += 1;
            }
        }

        if stats.deleted > 0 {
            tracing::info!(deleted = stats.deleted, kept = stats.kept_bytes, "evicted cache entries");
        }

        Ok(stats)
    }

    #[tracing::instrument(skip(self), err(Debug))]
    pub(crate) async fn delete_before(&self, threshold: SystemTime) -> CacheResult<SweepStats> {
        let _guard = self.open_lock.lock().await;

        let (entries, referenced) = self.list_entries().await?;
        let mut stats = SweepStats::default();

        for entry in entries {
            let expired = entry.modified < threshold;

            if expired && !referenced.contains(&entry.slug) && self.evict(&entry.slug).await? {
                stats.deleted += 1;
                continue;
            }

            if expired {
                stats.skipped += 1;
            }

            stats.kept_bytes += entry.size;
        }

        Ok(stats)
    }

    /// Lists the entries on disk, most recently used first, along with the slugs of the open
    /// entries that are referenced from outside the manager.
    async fn list_entries(&self) -> CacheResult<(Vec<DiskEntry>, HashSet<String>)> {
        let mut by_slug: HashMap<String, DiskEntry> = HashMap::new();
        let mut files = tokio::fs::read_dir(self.store.root()).await?;

        while let Some(file) = files.next_entry().await? {
            let path = file.path();

            // Slugs never contain a dot, everything after the first one is an extension.
            let Some(slug) = path
                .file_name()
                .and_then(OsStr::to_str)
                .and_then(|name| name.split('.').next())
                .filter(|slug| !slug.is_empty())
            else {
                continue;
            };

            let metadata = file.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata.modified()?;
            let disk_entry = by_slug.entry(slug.to_owned()).or_insert_with(|| DiskEntry {
                slug: slug.to_owned(),
                size: 0,
                modified,
            });

            disk_entry.size += metadata.len();
            disk_entry.modified = disk_entry.modified.max(modified);
        }

        let mut referenced = HashSet::new();

        for holder in self.entries().values() {
            if let Some(disk_entry) = by_slug.get_mut(holder.slug()) {
                disk_entry.modified = disk_entry.modified.max(holder.last_access());
            }

            if holder.refs() > 0 || holder.entry().subscriber_count() > 1 {
                referenced.insert(holder.slug().to_owned());
            }
        }

        let mut entries: Vec<_> = by_slug.into_values().collect();
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));

        Ok((entries, referenced))
    }

    /// Forces an unreferenced entry out of memory and deletes its files.
    ///
    /// Returns `false` if the entry got referenced in the meantime.
    async fn evict(&self, slug: &str) -> CacheResult<bool> {
        let holder = {
            let mut entries = self.entries();

            let open = entries
                .iter()
                .find(|(_, holder)| holder.slug() == slug)
                .map(|(key, holder)| (key.clone(), holder.clone()));

            match open {
                Some((_, holder))
                    if holder.refs() > 0 || holder.entry().subscriber_count() > 1 =>
                {
                    return Ok(false)
                }
                Some((key, holder)) => {
                    entries.remove(&key);
                    Some(holder)
                }
                None => None,
            }
        };

        if let Some(holder) = holder {
            tracing::debug!(key = holder.entry().key(), "forcing entry out of memory");

            // The entry is about to be deleted, there is no point in persisting it.
            self.forget(&holder);

            if let Err(e) = holder.data().close().await {
                tracing::warn!(key = holder.entry().key(), "could not close data access: {e}");
            }
        }

        self.store.delete_slug(slug).await?;
        Ok(true)
    }
}
