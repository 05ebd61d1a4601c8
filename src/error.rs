use std::{io::Error as IoError, string::FromUtf8Error, sync::Arc};

use reqwest::{Error as ReqError, StatusCode};
use thiserror::Error as ThisError;
use tokio::task::JoinError;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, ThisError)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] IoError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("metadata format error: {0}")]
    Format(#[from] FormatError),
    #[error("background transfer failed: {0}")]
    TransferFailed(#[source] Arc<CacheError>),
    #[error("background task joining error: {0}")]
    JoinTask(#[from] JoinError),
    #[error("block index {block} out of range (must be less than {block_count})")]
    BlockOutOfRange { block: u64, block_count: u64 },
    #[error("expected to read {expected} bytes at {pos}, but got only {actual}")]
    ShortRead {
        pos: u64,
        expected: usize,
        actual: usize,
    },
    #[error("resource of {size} bytes exceeds the maximum cacheable size")]
    ResourceTooLarge { size: u64 },
    #[error("data access for {0} is closed")]
    Closed(String),
    #[error("invalid cache configuration: {0}")]
    Config(&'static str),
}

/// Errors that originate from talking to the remote side of a transfer.
///
/// Kept separate so that consumers can tell a blocked resource (`Forbidden`) from a missing one
/// (`NotFound`) from something worth retrying later.
#[derive(Debug, ThisError)]
pub enum TransferError {
    #[error("not allowed to read {url}")]
    Forbidden { url: String },
    #[error("resource not found at {url}")]
    NotFound { url: String },
    #[error("expected status 206 for {url}, got {status}")]
    UnexpectedStatus { url: String, status: StatusCode },
    #[error("response for {url} does not declare its length")]
    MissingLength { url: String },
    #[error("response for {url} has {actual} remaining bytes, expected {expected}")]
    LengthMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },
    #[error("remote stream ended at {offset} before reaching {size} bytes")]
    PrematureEnd { offset: u64, size: u64 },
    #[error("download request error: {0}")]
    Request(#[from] ReqError),
    #[error("download IO error: {0}")]
    Io(#[from] IoError),
}

impl TransferError {
    /// Maps a non-partial-content status onto the matching error kind.
    pub(crate) fn from_status(url: &str, status: StatusCode) -> Self {
        let url = url.to_owned();

        match status {
            StatusCode::FORBIDDEN => Self::Forbidden { url },
            StatusCode::NOT_FOUND => Self::NotFound { url },
            status => Self::UnexpectedStatus { url, status },
        }
    }
}

#[derive(Debug, ThisError)]
pub enum FormatError {
    #[error("metadata truncated: needed {needed} more bytes for {field}")]
    Truncated { field: &'static str, needed: usize },
    #[error("metadata key is not valid UTF-8: {0}")]
    Key(#[source] FromUtf8Error),
    #[error("availability has {actual} bytes, expected {expected} for {size} bytes")]
    AvailabilityLength {
        size: u64,
        expected: usize,
        actual: usize,
    },
    #[error("availability marks block {block} beyond block count {block_count}")]
    AvailabilityOverflow { block: u64, block_count: u64 },
    #[error("{0} trailing bytes after metadata")]
    TrailingBytes(usize),
}
