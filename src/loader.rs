use std::sync::Arc;

use bytes::BytesMut;

use crate::{
    data_access::{DataAccess, ReportingDataAccess},
    entry::CacheEntry,
    error::{CacheResult, TransferError},
    remote::{RemoteSource, RemoteStream},
};

/// Outcome of a single [`Loader::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Done,
}

/// Copies a remote resource block by block into its data storage.
///
/// The transfer resumes at the first block the entry is missing. Every completed block write goes
/// through a [`ReportingDataAccess`], which is what advances the entry's availability.
pub struct Loader {
    entry: Arc<CacheEntry>,
    data: Arc<ReportingDataAccess>,
    remote: Arc<dyn RemoteSource>,
    stream: Option<Box<dyn RemoteStream>>,
    /// Index of the next block to write.
    cursor: u64,
    /// Bytes received from the remote but not yet written.
    pending: BytesMut,
    done: bool,
}

impl Loader {
    pub fn new(data: Arc<ReportingDataAccess>, remote: Arc<dyn RemoteSource>) -> Self {
        let entry = data.entry().clone();
        let cursor = entry.first_missing_block();

        Self {
            entry,
            data,
            remote,
            stream: None,
            cursor,
            pending: BytesMut::new(),
            done: false,
        }
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Byte offset the transfer continues from.
    pub fn resume_offset(&self) -> u64 {
        self.entry.contiguous_len()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Performs one unit of work.
    ///
    /// The first call only opens the remote stream. Every following call writes exactly one
    /// block, until the end of the resource is reached and [`Step::Done`] is returned. Errors are
    /// returned as they happen; a failed loader must not be stepped again.
    #[tracing::instrument(skip(self), fields(key = self.entry.key(), block = self.cursor), err(Debug))]
    pub async fn step(&mut self) -> CacheResult<Step> {
        if self.done {
            return Ok(Step::Done);
        }

        let Some(stream) = self.stream.as_mut() else {
            return self.open().await;
        };

        if self.cursor >= self.entry.block_count() {
            tracing::info!("transfer complete");
            self.done = true;
            self.stream = None;
            return Ok(Step::Done);
        }

        #[allow(clippy::cast_possible_truncation)]
        let block_len = self.entry.block_len(self.cursor) as usize;

        while self.pending.len() < block_len {
            let Some(chunk) = stream.chunk().await? else {
                let offset = self.cursor * self.entry.block_size() + self.pending.len() as u64;

                return Err(TransferError::PrematureEnd {
                    offset,
                    size: self.entry.size(),
                }
                .into());
            };

            self.pending.extend_from_slice(&chunk);
        }

        let block = self.pending.split_to(block_len);
        self.data.write_block(self.cursor, &block).await?;
        self.cursor += 1;

        Ok(Step::Continue)
    }

    /// Steps until the transfer is done or fails.
    pub async fn run(mut self) -> CacheResult<()> {
        while self.step().await? == Step::Continue {}
        Ok(())
    }

    async fn open(&mut self) -> CacheResult<Step> {
        let offset = self.resume_offset();
        let size = self.entry.size();

        if offset >= size {
            tracing::debug!("nothing left to transfer");
            self.done = true;
            return Ok(Step::Done);
        }

        let stream = self.remote.open(self.entry.key(), offset).await?;

        if let Some(remaining) = stream.remaining() {
            if remaining != size - offset {
                return Err(TransferError::LengthMismatch {
                    url: self.entry.key().to_owned(),
                    expected: size - offset,
                    actual: remaining,
                }
                .into());
            }
        }

        self.cursor = self.entry.first_missing_block();
        self.stream = Some(stream);

        Ok(Step::Continue)
    }
}
