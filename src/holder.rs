use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::SystemTime,
};

use tokio::task::JoinHandle;

use crate::{
    data_access::ReportingDataAccess,
    entry::CacheEntry,
    error::{CacheError, CacheResult},
    loader::Loader,
    remote::RemoteSource,
};

/// An entry opened by the [`crate::CacheManager`], together with everything needed to read and
/// fill it.
///
/// Owns the one background transfer of the entry, no matter how many readers share it.
pub(crate) struct CacheEntryHolder {
    entry: Arc<CacheEntry>,
    data: Arc<ReportingDataAccess>,
    remote: Arc<dyn RemoteSource>,
    slug: String,
    /// Number of live [`crate::CacheReader`]s.
    refs: AtomicUsize,
    last_access: Mutex<SystemTime>,
    transfer: Mutex<TransferState>,
    /// Tells apart the outcomes of successive transfer tasks.
    generations: AtomicU64,
}

#[derive(Debug)]
enum TransferState {
    Idle,
    Running {
        handle: JoinHandle<()>,
        generation: u64,
    },
    Finished,
    Failed(Arc<CacheError>),
}

impl CacheEntryHolder {
    pub(crate) fn new(
        data: Arc<ReportingDataAccess>,
        remote: Arc<dyn RemoteSource>,
        slug: String,
    ) -> Self {
        Self {
            entry: data.entry().clone(),
            data,
            remote,
            slug,
            refs: AtomicUsize::new(0),
            last_access: Mutex::new(SystemTime::now()),
            transfer: Mutex::new(TransferState::Idle),
            generations: AtomicU64::new(0),
        }
    }

    pub(crate) fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    pub(crate) fn data(&self) -> &Arc<ReportingDataAccess> {
        &self.data
    }

    pub(crate) fn slug(&self) -> &str {
        &self.slug
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference and returns how many are left.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                Some(refs.saturating_sub(1))
            })
            .unwrap_or_default();

        previous.saturating_sub(1)
    }

    pub(crate) fn touch(&self) {
        *self.last_access.lock().unwrap() = SystemTime::now();
    }

    pub(crate) fn last_access(&self) -> SystemTime {
        *self.last_access.lock().unwrap()
    }

    pub(crate) fn is_transferring(&self) -> bool {
        matches!(
            &*self.transfer.lock().unwrap(),
            TransferState::Running { handle, .. } if !handle.is_finished()
        )
    }

    /// Makes sure a transfer is running unless the entry is complete.
    ///
    /// A recorded failure is returned instead of starting over; see [`Self::clear_failure`].
    pub(crate) fn ensure_transfer(self: &Arc<Self>) -> CacheResult<()> {
        if self.entry.is_fully_available() {
            return Ok(());
        }

        let mut transfer = self.transfer.lock().unwrap();

        match &*transfer {
            TransferState::Running { handle, .. } if !handle.is_finished() => return Ok(()),
            TransferState::Failed(e) => return Err(CacheError::TransferFailed(e.clone())),
            // A task that finished without recording its outcome died, so it gets replaced.
            TransferState::Running { .. } | TransferState::Idle | TransferState::Finished => (),
        }

        let generation = self.generations.fetch_add(1, Ordering::AcqRel);

        tracing::info!(key = self.entry.key(), generation, "starting transfer");

        let handle = tokio::spawn(Self::run_transfer(
            Arc::downgrade(self),
            Loader::new(self.data.clone(), self.remote.clone()),
            generation,
        ));

        *transfer = TransferState::Running { handle, generation };
        Ok(())
    }

    async fn run_transfer(holder: Weak<Self>, loader: Loader, generation: u64) {
        let entry = loader.entry().clone();
        let result = loader.run().await;

        if let Some(holder) = holder.upgrade() {
            holder.transfer_stopped(generation, result);
        }

        // Readers re-check the transfer state once woken up.
        entry.wake_waiters();
    }

    fn transfer_stopped(&self, generation: u64, result: CacheResult<()>) {
        let mut transfer = self.transfer.lock().unwrap();

        match &*transfer {
            TransferState::Running { generation: g, .. } if *g == generation => (),
            // Superseded by a restarted transfer.
            _ => return,
        }

        *transfer = match result {
            Ok(()) => TransferState::Finished,
            Err(e) => {
                tracing::error!(key = self.entry.key(), "transfer failed: {e}");
                TransferState::Failed(Arc::new(e))
            }
        };
    }

    /// Aborts a running transfer. Already written blocks stay valid.
    pub(crate) fn stop_transfer(&self) {
        let mut transfer = self.transfer.lock().unwrap();

        if let TransferState::Running { handle, .. } = &*transfer {
            tracing::debug!(key = self.entry.key(), "stopping transfer");
            handle.abort();
            *transfer = TransferState::Idle;
        }
    }

    /// Replaces a transfer that stopped making progress.
    pub(crate) fn restart_transfer(self: &Arc<Self>) -> CacheResult<()> {
        tracing::warn!(key = self.entry.key(), "transfer stalled, restarting");
        self.stop_transfer();
        self.ensure_transfer()
    }

    /// Forgets a failed transfer, so that the next read tries again.
    pub(crate) fn clear_failure(&self) {
        let mut transfer = self.transfer.lock().unwrap();

        if matches!(&*transfer, TransferState::Failed(_)) {
            *transfer = TransferState::Idle;
        }
    }
}
