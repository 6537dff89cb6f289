//! Chunked transfer over a single write primitive
//!
//! A [`Transfer`] walks the frames of one payload in order. The
//! [`TransferEngine`] hands each encoded frame to the caller's write
//! function and stops at the first failure, reporting the chunk index so
//! the session can decide whether the next attempt restarts or resumes.

use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{OtaError, Result};
use crate::protocol::checksum::ChecksumMode;
use crate::protocol::frame::{chunk_count, frame_at, Frame};

/// How a failed Send attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategy {
    /// Every attempt starts again at chunk 0.
    #[default]
    Restart,
    /// The next attempt starts at the chunk that failed.
    Resume,
}

/// Cursor over the frames of one payload.
#[derive(Debug, Clone)]
pub struct Transfer<'a> {
    payload: &'a [u8],
    mtu: usize,
    num_chunks: u8,
    cur_chunk: u8,
    checksum: ChecksumMode,
}

impl<'a> Transfer<'a> {
    pub fn new(payload: &'a [u8], mtu: usize, checksum: ChecksumMode) -> Result<Self> {
        let num_chunks = chunk_count(payload.len(), mtu)?;
        Ok(Self {
            payload,
            mtu,
            num_chunks,
            cur_chunk: 0,
            checksum,
        })
    }

    /// Skip ahead to `index`. Clamped to the chunk count.
    pub fn starting_at(mut self, index: u8) -> Self {
        self.cur_chunk = index.min(self.num_chunks);
        self
    }

    pub fn cur_chunk(&self) -> u8 {
        self.cur_chunk
    }

    pub fn num_chunks(&self) -> u8 {
        self.num_chunks
    }

    pub fn is_complete(&self) -> bool {
        self.cur_chunk >= self.num_chunks
    }

    pub fn current_frame(&self) -> Option<Frame> {
        if self.is_complete() {
            return None;
        }
        Some(frame_at(
            self.payload,
            self.mtu,
            self.num_chunks,
            self.cur_chunk,
            self.checksum,
        ))
    }

    /// Move past the current chunk after it was written.
    pub fn advance(&mut self) {
        if !self.is_complete() {
            self.cur_chunk += 1;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferEngine {
    mtu: usize,
    checksum: ChecksumMode,
    pacing: Option<Duration>,
}

impl TransferEngine {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            checksum: ChecksumMode::default(),
            pacing: None,
        }
    }

    pub fn with_checksum(mut self, checksum: ChecksumMode) -> Self {
        self.checksum = checksum;
        self
    }

    /// Sleep this long after every successful write.
    pub fn with_pacing(mut self, pacing: Option<Duration>) -> Self {
        self.pacing = pacing.filter(|d| !d.is_zero());
        self
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub async fn send<F, Fut>(&self, payload: &[u8], write_fn: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = bool>,
    {
        self.send_from(payload, 0, write_fn).await
    }

    /// Write frames `start..num_chunks` in order. Returns
    /// [`OtaError::ChunkWriteFailed`] with the index of the first frame the
    /// write function rejected; nothing after it is written.
    pub async fn send_from<F, Fut>(&self, payload: &[u8], start: u8, mut write_fn: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut transfer = Transfer::new(payload, self.mtu, self.checksum)?.starting_at(start);
        let total = transfer.num_chunks();

        while let Some(frame) = transfer.current_frame() {
            let index = frame.header.cur_chunk;
            let bytes = frame.encode();
            debug!("Chunk {}/{}: {} bytes", index as usize + 1, total, bytes.len());

            if !write_fn(bytes).await {
                warn!("Write of chunk {}/{} failed", index as usize + 1, total);
                return Err(OtaError::ChunkWriteFailed { index });
            }
            transfer.advance();

            if let Some(delay) = self.pacing {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}

/// Send `payload` at `mtu` with default settings.
pub async fn send<F, Fut>(payload: &[u8], mtu: usize, write_fn: F) -> Result<()>
where
    F: FnMut(Vec<u8>) -> Fut,
    Fut: Future<Output = bool>,
{
    TransferEngine::new(mtu).send(payload, write_fn).await
}
