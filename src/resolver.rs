use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::{
    error::{CacheResult, TransferError},
    remote::{content_range_total, HttpRemote},
    store::CacheEntryStore,
};

/// Identity and total size of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlInfo {
    pub key: String,
    pub size: u64,
}

/// Resolves the total size of a resource.
#[async_trait]
pub trait UrlInfoResolver: Send + Sync {
    async fn resolve(&self, key: &str) -> CacheResult<UrlInfo>;
}

/// Asks the server for the size, using a one byte range request and reading the complete length
/// from the `Content-Range` header of the answer.
///
/// An empty resource has no first byte; it is recognized by a `416` answer carrying
/// `Content-Range: bytes */0`.
#[derive(Debug, Clone, Default)]
pub struct HttpUrlInfoResolver {
    remote: HttpRemote,
}

impl HttpUrlInfoResolver {
    pub fn new(remote: HttpRemote) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl UrlInfoResolver for HttpUrlInfoResolver {
    #[tracing::instrument(skip(self), err(Debug))]
    async fn resolve(&self, key: &str) -> CacheResult<UrlInfo> {
        let response = self.remote.send_range(key, "bytes=0-0").await?;

        let size = match response.status() {
            StatusCode::PARTIAL_CONTENT => content_range_total(&response),
            // An empty resource has no byte 0; servers answer `bytes */0`.
            StatusCode::RANGE_NOT_SATISFIABLE => content_range_total(&response)
                .filter(|size| *size == 0)
                .ok_or_else(|| TransferError::from_status(key, response.status()))
                .map(Some)?,
            status => return Err(TransferError::from_status(key, status).into()),
        };

        let size = size.ok_or_else(|| TransferError::MissingLength {
            url: key.to_owned(),
        })?;

        tracing::debug!(size, "resolved size from network");

        Ok(UrlInfo {
            key: key.to_owned(),
            size,
        })
    }
}

/// Prefers the size recorded in persisted metadata over asking the wrapped resolver.
pub struct CachingUrlInfoResolver {
    store: Arc<CacheEntryStore>,
    inner: Arc<dyn UrlInfoResolver>,
}

impl CachingUrlInfoResolver {
    pub fn new(store: Arc<CacheEntryStore>, inner: Arc<dyn UrlInfoResolver>) -> Self {
        Self { store, inner }
    }
}

#[async_trait]
impl UrlInfoResolver for CachingUrlInfoResolver {
    async fn resolve(&self, key: &str) -> CacheResult<UrlInfo> {
        if let Some(entry) = self.store.load(key).await? {
            tracing::debug!(key, size = entry.size(), "resolved size from metadata");

            return Ok(UrlInfo {
                key: key.to_owned(),
                size: entry.size(),
            });
        }

        self.inner.resolve(key).await
    }
}
