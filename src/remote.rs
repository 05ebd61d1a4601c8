//! The network side of a transfer: a byte-range capable fetch primitive.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{CONTENT_RANGE, RANGE},
    Client, Response, StatusCode,
};

use crate::error::TransferError;

/// Opens resumable streams of a remote resource.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Opens the resource identified by `key`, starting at byte `offset`.
    async fn open(&self, key: &str, offset: u64) -> Result<Box<dyn RemoteStream>, TransferError>;
}

/// An open remote stream, yielding the bytes of a resource in order.
#[async_trait]
pub trait RemoteStream: Send {
    /// Number of bytes the remote announced to send, if it did.
    fn remaining(&self) -> Option<u64>;

    /// Returns the next chunk of bytes, or `None` at the end of the stream.
    async fn chunk(&mut self) -> Result<Option<Bytes>, TransferError>;
}

/// [`RemoteSource`] that issues `Range: bytes=N-` requests.
///
/// Any answer other than `206 Partial Content` is an error, so a resumed transfer can never
/// silently write the start of a resource at the resume offset.
#[derive(Debug, Clone, Default)]
pub struct HttpRemote {
    client: Client,
}

impl HttpRemote {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Sends a range request and checks that it got answered with partial content.
    #[tracing::instrument(skip(self), err(Debug))]
    pub(crate) async fn range_request(
        &self,
        url: &str,
        range: &str,
    ) -> Result<Response, TransferError> {
        let response = self.send_range(url, range).await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(response),
            status => Err(TransferError::from_status(url, status)),
        }
    }

    /// Sends a range request, whatever the answer.
    pub(crate) async fn send_range(
        &self,
        url: &str,
        range: &str,
    ) -> Result<Response, TransferError> {
        Ok(self.client.get(url).header(RANGE, range).send().await?)
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn open(&self, key: &str, offset: u64) -> Result<Box<dyn RemoteStream>, TransferError> {
        tracing::info!(key, offset, "resuming transfer");

        let response = self.range_request(key, &format!("bytes={offset}-")).await?;
        let remaining = response.content_length();

        Ok(Box::new(HttpStream {
            response,
            remaining,
        }))
    }
}

/// Body of a partial content response.
#[derive(Debug)]
pub struct HttpStream {
    response: Response,
    remaining: Option<u64>,
}

#[async_trait]
impl RemoteStream for HttpStream {
    fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        Ok(self.response.chunk().await?)
    }
}

/// Extracts the complete length from a `Content-Range: bytes a-b/total` header.
pub(crate) fn content_range_total(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let (unit, rest) = value.split_once(' ')?;

    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }

    rest.rsplit_once('/')?.1.trim().parse().ok()
}
