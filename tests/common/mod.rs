#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use media_cache::{
    error::{CacheResult, TransferError},
    CacheConfig, CacheEntryStore, CacheManager, FileDataAccessFactory, RemoteSource,
    RemoteStream, UrlInfo, UrlInfoResolver,
};
use tempdir::TempDir;
use tokio::sync::Semaphore;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

pub const TEMP_DIR_PREFIX: &str = "media_cache";
pub const MEDIA_KEY: &str = "http://media.test/videos/clip.mp4";

pub fn init_logger() {
    tracing_subscriber::fmt()
        // .with_span_events(FmtSpan::ACTIVE)
        .with_max_level(LevelFilter::DEBUG)
        .finish()
        .try_init()
        .ok();
}

pub fn temp_dir() -> TempDir {
    init_logger();

    let temp_dir = TempDir::new(TEMP_DIR_PREFIX).unwrap();
    tracing::info!("test directory {}", temp_dir.as_ref().display());
    temp_dir
}

/// Deterministic resource content.
#[allow(clippy::cast_possible_truncation)]
pub fn payload(size: usize) -> Bytes {
    (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

/// Configuration with short timings, so that tests never wait for long.
pub fn test_config(temp_dir: &TempDir, block_size: u64) -> CacheConfig {
    CacheConfig::new(temp_dir.path())
        .with_block_size(block_size)
        .with_read_poll_interval(Duration::from_millis(20))
        .with_idle_timeout(Duration::from_secs(5))
}

/// Serves an in-memory resource, optionally holding back every chunk until it is released.
pub struct FakeRemote {
    data: Bytes,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    announce_length: bool,
    opens: AtomicUsize,
    offsets: Mutex<Vec<u64>>,
}

impl FakeRemote {
    pub fn new(data: Bytes, chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size,
            gate: None,
            announce_length: true,
            opens: AtomicUsize::new(0),
            offsets: Mutex::default(),
        }
    }

    /// Every chunk needs a permit handed out through [`FakeRemote::release`].
    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Streams do not tell how many bytes they are going to send.
    pub fn unannounced(mut self) -> Self {
        self.announce_length = false;
        self
    }

    pub fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn open(&self, key: &str, offset: u64) -> Result<Box<dyn RemoteStream>, TransferError> {
        tracing::debug!(key, offset, "opening fake stream");

        self.opens.fetch_add(1, Ordering::SeqCst);
        self.offsets.lock().unwrap().push(offset);

        #[allow(clippy::cast_possible_truncation)]
        let data = self.data.slice((offset as usize).min(self.data.len())..);
        let remaining = self.announce_length.then_some(data.len() as u64);

        Ok(Box::new(FakeStream {
            data,
            chunk_size: self.chunk_size,
            gate: self.gate.clone(),
            remaining,
        }))
    }
}

struct FakeStream {
    data: Bytes,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    remaining: Option<u64>,
}

#[async_trait]
impl RemoteStream for FakeStream {
    fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        if self.data.is_empty() {
            return Ok(None);
        }

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        let len = self.chunk_size.min(self.data.len());
        Ok(Some(self.data.split_to(len)))
    }
}

/// Resolves every key to the same size, counting the calls.
pub struct FixedResolver {
    size: u64,
    calls: AtomicUsize,
}

impl FixedResolver {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UrlInfoResolver for FixedResolver {
    async fn resolve(&self, key: &str) -> CacheResult<UrlInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        Ok(UrlInfo {
            key: key.to_owned(),
            size: self.size,
        })
    }
}

pub struct TestSetup {
    pub temp_dir: TempDir,
    pub remote: Arc<FakeRemote>,
    pub resolver: Arc<FixedResolver>,
    pub manager: CacheManager,
}

impl TestSetup {
    #[allow(clippy::missing_panics_doc)]
    pub async fn new(remote: FakeRemote, block_size: u64) -> Self {
        let temp_dir = temp_dir();
        let config = test_config(&temp_dir, block_size);

        Self::with_config(temp_dir, config, remote).await
    }

    #[allow(clippy::missing_panics_doc)]
    pub async fn with_config(temp_dir: TempDir, config: CacheConfig, remote: FakeRemote) -> Self {
        let size = remote.data.len() as u64;
        Self::with_size(temp_dir, config, remote, size).await
    }

    /// Announces `size` as the size of every resource, whatever the remote actually serves.
    #[allow(clippy::missing_panics_doc)]
    pub async fn with_size(
        temp_dir: TempDir,
        config: CacheConfig,
        remote: FakeRemote,
        size: u64,
    ) -> Self {
        let remote = Arc::new(remote);
        let resolver = Arc::new(FixedResolver::new(size));

        let manager = CacheManager::with_parts(
            config,
            remote.clone(),
            resolver.clone(),
            Arc::new(FileDataAccessFactory),
        )
        .await
        .unwrap();

        Self {
            temp_dir,
            remote,
            resolver,
            manager,
        }
    }
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn data_path(temp_dir: &TempDir, key: &str) -> std::path::PathBuf {
    temp_dir.path().join(format!(
        "{}.{}",
        CacheEntryStore::slug(key),
        CacheEntryStore::DATA_EXTENSION
    ))
}
