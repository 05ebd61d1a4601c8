use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};

use futures::FutureExt;
use tokio::{
    task::{JoinHandle, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    config::CacheConfig,
    data_access::{DataAccess, DataAccessFactory, FileDataAccessFactory, ReportingDataAccess},
    entry::{CacheEntry, WriteListener},
    error::{CacheError, CacheResult},
    holder::CacheEntryHolder,
    persister::CacheEntryPersister,
    reader::CacheReader,
    remote::{HttpRemote, RemoteSource},
    resolver::{CachingUrlInfoResolver, HttpUrlInfoResolver, UrlInfo, UrlInfoResolver},
    store::{CacheEntryStore, IndexRecord},
};

pub(crate) type BackgroundTasks = Arc<Mutex<JoinSet<CacheResult<()>>>>;

/// Registry of the open cache entries.
///
/// Entries are opened through [`CacheManager::acquire`] and stay in memory for as long as a
/// [`CacheReader`] references them. The manager listens to writes on every entry it opened and
/// persists changed entries periodically, see [`CacheManager::spawn_maintenance`].
///
/// Cloning is cheap; all clones refer to the same registry.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(crate) config: CacheConfig,
    pub(crate) store: Arc<CacheEntryStore>,
    resolver: Arc<dyn UrlInfoResolver>,
    remote: Arc<dyn RemoteSource>,
    data_access: Arc<dyn DataAccessFactory>,
    /// Open entries, by key.
    pub(crate) entries: Mutex<HashMap<String, Arc<CacheEntryHolder>>>,
    dirty: Arc<DirtyEntries>,
    /// The manager's subscription on its entries; the same allocation as `dirty`.
    listener: Arc<dyn WriteListener>,
    /// Serializes creating entries and deleting their files.
    pub(crate) open_lock: tokio::sync::Mutex<()>,
    /// Background tasks that the cache manager is responsible for.
    tasks: BackgroundTasks,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Entries written to since they were last persisted.
#[derive(Default)]
struct DirtyEntries(Mutex<HashMap<String, Arc<CacheEntry>>>);

impl DirtyEntries {
    fn take_all(&self) -> Vec<Arc<CacheEntry>> {
        self.0.lock().unwrap().drain().map(|(_, entry)| entry).collect()
    }

    /// Removes the entry, returning whether it was dirty.
    fn take(&self, entry: &Arc<CacheEntry>) -> bool {
        let mut dirty = self.0.lock().unwrap();

        match dirty.get(entry.key()) {
            Some(e) if Arc::ptr_eq(e, entry) => dirty.remove(entry.key()).is_some(),
            _ => false,
        }
    }
}

impl WriteListener for DirtyEntries {
    fn on_write(&self, entry: &Arc<CacheEntry>, _block: u64) {
        self.0
            .lock()
            .unwrap()
            .insert(entry.key().to_owned(), entry.clone());
    }
}

impl CacheManager {
    /// Creates a [`CacheManager`] that fetches resources over HTTP and stores them at the
    /// configured root.
    ///
    /// With [`CacheConfig::resume`] set, the files of a previous run are indexed and leftovers of
    /// interrupted writes are removed.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        let remote = HttpRemote::default();
        let resolver = HttpUrlInfoResolver::new(remote.clone());

        Self::with_parts(
            config,
            Arc::new(remote),
            Arc::new(resolver),
            Arc::new(FileDataAccessFactory),
        )
        .await
    }

    /// Creates a [`CacheManager`] from its collaborators.
    ///
    /// The `resolver` is only asked for resources without persisted metadata.
    #[tracing::instrument(skip_all, fields(root = format_args!("{}", config.root.display())), err(Debug))]
    pub async fn with_parts(
        config: CacheConfig,
        remote: Arc<dyn RemoteSource>,
        resolver: Arc<dyn UrlInfoResolver>,
        data_access: Arc<dyn DataAccessFactory>,
    ) -> CacheResult<Self> {
        config.validate()?;

        let store = Arc::new(CacheEntryStore::new(
            &config.root,
            CacheEntryPersister::new(config.block_size),
        ));

        if config.resume {
            let restored = store.restore().await?;
            tracing::info!(restored, "restored cache index");
        } else {
            tokio::fs::create_dir_all(&config.root).await?;
        }

        let resolver = Arc::new(CachingUrlInfoResolver::new(store.clone(), resolver));
        let dirty = Arc::new(DirtyEntries::default());
        let listener: Arc<dyn WriteListener> = dirty.clone();

        let inner = ManagerInner {
            config,
            store,
            resolver,
            remote,
            data_access,
            entries: Mutex::default(),
            dirty,
            listener,
            open_lock: tokio::sync::Mutex::new(()),
            tasks: Arc::default(),
            maintenance: Mutex::default(),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn root(&self) -> &Path {
        self.inner.store.root()
    }

    /// Opens a reader on the resource identified by `key`.
    ///
    /// The size of the resource is taken from persisted metadata if there is some, otherwise it
    /// is resolved over the network. Data cached by earlier runs is reused. Acquiring an entry
    /// whose transfer failed allows the transfer to be tried again.
    #[tracing::instrument(skip(self), err(Debug))]
    pub async fn acquire(&self, key: &str) -> CacheResult<CacheReader> {
        // Check to see if any background task has finished and evict it if so.
        self.evict_finished_tasks();

        if let Some(holder) = self.inner.retain_open(key) {
            return Ok(self.reader(holder));
        }

        let info = self.inner.resolver.resolve(key).await?;

        let _guard = self.inner.open_lock.lock().await;

        // Someone else might have opened the entry while we were resolving.
        if let Some(holder) = self.inner.retain_open(key) {
            return Ok(self.reader(holder));
        }

        let holder = self.inner.open_holder(&info).await?;
        holder.retain();

        self.inner
            .entries()
            .insert(info.key.clone(), holder.clone());

        if let Err(e) = touch(&self.inner.store.data_path(key)).await {
            tracing::warn!("could not update the modification time: {e}");
        }

        Ok(self.reader(holder))
    }

    fn reader(&self, holder: Arc<CacheEntryHolder>) -> CacheReader {
        CacheReader::new(
            holder,
            Arc::downgrade(&self.inner),
            self.inner.config.read_poll_interval,
            self.inner.config.idle_timeout,
        )
    }

    /// Removes the entry from memory if nothing but the manager itself refers to it.
    ///
    /// Returns whether the entry got removed. A dirty entry is persisted one last time before its
    /// data access is closed.
    pub fn try_remove_cache_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        self.inner.try_remove_cache_entry(entry)
    }

    /// Whether the entry for `key` is currently held in memory.
    pub fn is_open(&self, key: &str) -> bool {
        self.inner.entries().contains_key(key)
    }

    /// Persists every entry that changed since it was last persisted.
    ///
    /// Failing to persist one entry does not keep the others from being persisted. Returns the
    /// number of persisted entries.
    pub async fn flush(&self) -> usize {
        self.inner.flush().await
    }

    /// Persists the metadata of the entry right away.
    pub async fn store(&self, entry: &Arc<CacheEntry>) -> CacheResult<()> {
        self.inner.dirty.take(entry);
        self.inner.store.store(entry).await
    }

    /// Whether persisted metadata for `key` is known.
    pub fn exists(&self, key: &str) -> bool {
        self.inner.store.exists(key)
    }

    /// What is known about the persisted entry for `key`.
    pub fn get(&self, key: &str) -> Option<IndexRecord> {
        self.inner.store.get(key)
    }

    /// Resolves the size of the resource, preferring persisted metadata.
    pub async fn resolve(&self, key: &str) -> CacheResult<UrlInfo> {
        self.inner.resolver.resolve(key).await
    }

    /// Starts the periodic flush of dirty entries and the eviction sweep.
    ///
    /// The timer stops on [`CacheManager::shutdown`] or once the last clone of the manager is
    /// dropped.
    #[allow(clippy::missing_panics_doc)]
    pub fn spawn_maintenance(&self) {
        let inner = Arc::downgrade(&self.inner);
        let config = &self.inner.config;

        let mut flush = interval_at(
            Instant::now() + config.flush_interval,
            config.flush_interval,
        );
        let mut sweep = interval_at(
            Instant::now() + config.sweep_interval,
            config.sweep_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = flush.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.flush().await;
                    }
                    _ = sweep.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        let max_size = inner.config.max_cache_size;

                        if let Err(e) = inner.sweep(max_size).await {
                            tracing::error!("cache sweep failed: {e}");
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.inner.maintenance.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stops the maintenance timer, persists dirty entries and waits for the background tasks.
    #[allow(clippy::missing_panics_doc)]
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.maintenance.lock().unwrap().take() {
            handle.abort();
        }

        self.flush().await;
        self.wait_bg_tasks().await;
    }

    /// Method meant for graceful termination of the [`CacheManager`] by waiting for all the
    /// background tasks to finish.
    #[allow(clippy::missing_panics_doc)]
    pub async fn wait_bg_tasks(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for res in tasks.join_all().await {
            if let Err(e) = res {
                tracing::error!("error when waiting for background tasks: {e}");
            }
        }
    }

    /// Method used for evicting finished background tasks so as not to uncontrollably grow within
    /// the [`CacheManager`].
    ///
    /// This is achieved by polling the [`JoinSet`] only once, continuing to do so until a
    /// background task would pend.
    fn evict_finished_tasks(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        while let Some(res) = tasks.join_next().now_or_never().flatten() {
            let res = res.map_err(CacheError::JoinTask).and_then(|res| res);

            if let Err(e) = res {
                tracing::error!("background task finished with error: {e}");
            }
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }
}

impl ManagerInner {
    pub(crate) fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<CacheEntryHolder>>> {
        self.entries.lock().unwrap()
    }

    /// Takes a reference on the entry for `key` if it is open.
    fn retain_open(&self, key: &str) -> Option<Arc<CacheEntryHolder>> {
        let entries = self.entries();
        let holder = entries.get(key)?;

        holder.retain();
        holder.touch();
        holder.clear_failure();

        Some(holder.clone())
    }

    /// Loads or creates the entry and opens its data access.
    async fn open_holder(&self, info: &UrlInfo) -> CacheResult<Arc<CacheEntryHolder>> {
        let UrlInfo { key, size } = info;
        let block_size = self.config.block_size;

        let mut entry = self.store.acquire(key, *size).await?;
        let path = self.store.data_path(key);
        let opened = self.data_access.open(&path, key, *size, block_size).await?;

        if !opened.resumed && entry.available_len() > 0 {
            tracing::warn!(key, "cached data is gone, starting over");

            entry = CacheEntry::new(key.as_str(), *size, block_size);
            // The metadata on disk must not claim the reset data.
            self.store.store(&entry).await?;
        }

        let entry = Arc::new(entry);
        entry.subscribe(self.listener.clone());

        let data = Arc::new(ReportingDataAccess::new(entry, opened.data));

        Ok(Arc::new(CacheEntryHolder::new(
            data,
            self.remote.clone(),
            CacheEntryStore::slug(key),
        )))
    }

    /// Drops a reader's reference, removing the entry once no reader is left.
    pub(crate) fn release(&self, holder: &Arc<CacheEntryHolder>) {
        let entries = self.entries();

        if holder.release() > 0 {
            return;
        }

        holder.stop_transfer();
        self.remove_unreferenced(entries, holder.entry());
    }

    pub(crate) fn try_remove_cache_entry(&self, entry: &Arc<CacheEntry>) -> bool {
        let entries = self.entries();
        self.remove_unreferenced(entries, entry)
    }

    fn remove_unreferenced(
        &self,
        mut entries: MutexGuard<'_, HashMap<String, Arc<CacheEntryHolder>>>,
        entry: &Arc<CacheEntry>,
    ) -> bool {
        match entries.get(entry.key()) {
            Some(holder)
                if Arc::ptr_eq(holder.entry(), entry)
                    && holder.refs() == 0
                    && entry.subscriber_count() == 1 => {}
            _ => return false,
        }

        let Some(holder) = entries.remove(entry.key()) else {
            return false;
        };
        drop(entries);

        tracing::debug!(key = entry.key(), "removing entry from memory");

        let dirty = self.forget(&holder);
        let store = self.store.clone();

        self.spawn(async move {
            if dirty {
                if let Err(e) = store.store(holder.entry()).await {
                    tracing::error!(key = holder.entry().key(), "could not flush cache entry: {e}");
                }
            }

            holder.data().close().await
        });

        true
    }

    /// Detaches a holder that was taken out of the registry. Returns whether its entry was dirty.
    pub(crate) fn forget(&self, holder: &CacheEntryHolder) -> bool {
        holder.stop_transfer();
        holder.entry().unsubscribe(&self.listener);
        self.dirty.take(holder.entry())
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = CacheResult<()>> + Send + 'static,
    {
        // Readers may be dropped after the runtime is gone, nothing can be cleaned up then.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.tasks.lock().unwrap().spawn_on(future, &handle);
            }
            Err(_) => tracing::warn!("no runtime available for background cleanup"),
        }
    }

    async fn flush(&self) -> usize {
        let mut flushed = 0;

        for entry in self.dirty.take_all() {
            match self.store.store(&entry).await {
                Ok(()) => flushed += 1,
                Err(e) => tracing::error!(key = entry.key(), "could not flush cache entry: {e}"),
            }
        }

        if flushed > 0 {
            tracing::debug!(flushed, "flushed dirty cache entries");
        }

        flushed
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance.get_mut().unwrap().take() {
            handle.abort();
        }
    }
}

/// Bumps the modification time of the file, marking it as recently used for the sweep.
async fn touch(path: &Path) -> CacheResult<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?
        .into_std()
        .await;

    tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now())).await??;
    Ok(())
}
