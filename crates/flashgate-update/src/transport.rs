//! Transport boundary: where image bytes come from
//!
//! The engine pulls chunks from a [`ChunkSource`] one at a time and never
//! overlaps a read with a flash write. Timeouts are reported separately from
//! failures because the engine retries the former and aborts on the latter.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Why a chunk read produced no data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Nothing arrived within the transport's receive timeout; retry
    #[error("receive timed out")]
    Timeout,

    /// Peer closed the stream
    #[error("connection closed by peer")]
    Closed,

    /// Transport-level failure
    #[error("transport error: {0}")]
    Io(String),
}

/// Source of image bytes for one upload
#[async_trait]
pub trait ChunkSource: Send {
    /// Read up to `buf.len()` bytes into `buf`, returning how many arrived
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ChunkError>;
}

/// Adapter over any tokio reader
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
}

impl<R> ReaderSource<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Recover the reader
    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[async_trait]
impl<R> ChunkSource for ReaderSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ChunkError> {
        match self.reader.read(buf).await {
            Ok(0) if !buf.is_empty() => Err(ChunkError::Closed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(ChunkError::Timeout)
            }
            Err(e) => Err(ChunkError::Io(e.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Timeouts(u32),
    Fail(String),
    Stall,
}

/// In-memory source that serves fixed-size chunks
///
/// Timeouts, failures and stalls can be scripted at byte offsets, which is
/// how tests and the simulator reproduce misbehaving transports.
#[derive(Debug, Clone)]
pub struct SliceSource {
    data: Vec<u8>,
    pos: usize,
    chunk_size: usize,
    events: VecDeque<(usize, Scripted)>,
    timeout_delay: Duration,
    timeouts_served: u32,
}

impl SliceSource {
    /// Serve `data` in chunks of at most `chunk_size` bytes
    pub fn new(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            data,
            pos: 0,
            chunk_size: chunk_size.max(1),
            events: VecDeque::new(),
            timeout_delay: Duration::ZERO,
            timeouts_served: 0,
        }
    }

    fn schedule(mut self, offset: usize, event: Scripted) -> Self {
        let at = self
            .events
            .iter()
            .position(|(o, _)| *o > offset)
            .unwrap_or(self.events.len());
        self.events.insert(at, (offset, event));
        self
    }

    /// Report `count` timeouts once `offset` bytes have been served
    pub fn timeouts_at(self, offset: usize, count: u32) -> Self {
        self.schedule(offset, Scripted::Timeouts(count))
    }

    /// Fail once `offset` bytes have been served
    pub fn fail_at(self, offset: usize, reason: impl Into<String>) -> Self {
        self.schedule(offset, Scripted::Fail(reason.into()))
    }

    /// Time out forever once `offset` bytes have been served
    pub fn stall_at(self, offset: usize) -> Self {
        self.schedule(offset, Scripted::Stall)
    }

    /// Wait this long before reporting each timeout
    pub fn with_timeout_delay(mut self, delay: Duration) -> Self {
        self.timeout_delay = delay;
        self
    }

    /// Bytes served so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Timeouts reported so far
    pub fn timeouts_served(&self) -> u32 {
        self.timeouts_served
    }

    async fn time_out(&mut self) -> Result<usize, ChunkError> {
        if !self.timeout_delay.is_zero() {
            tokio::time::sleep(self.timeout_delay).await;
        }
        self.timeouts_served = self.timeouts_served.saturating_add(1);
        Err(ChunkError::Timeout)
    }
}

#[async_trait]
impl ChunkSource for SliceSource {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ChunkError> {
        while let Some((offset, event)) = self.events.front_mut()
            && *offset <= self.pos
        {
            match event {
                Scripted::Timeouts(0) => {
                    self.events.pop_front();
                }
                Scripted::Timeouts(left) => {
                    *left = left.saturating_sub(1);
                    return self.time_out().await;
                }
                Scripted::Fail(reason) => {
                    let reason = std::mem::take(reason);
                    self.events.pop_front();
                    return Err(ChunkError::Io(reason));
                }
                Scripted::Stall => return self.time_out().await,
            }
        }

        // Never serve past the next scripted offset.
        let limit = self
            .events
            .front()
            .map_or(self.data.len(), |(offset, _)| *offset)
            .min(self.data.len());
        let end = self.pos.saturating_add(self.chunk_size).min(limit);
        let Some(src) = self.data.get(self.pos..end) else {
            return Err(ChunkError::Closed);
        };
        let n = src.len().min(buf.len());
        if n == 0 {
            return Err(ChunkError::Closed);
        }
        if let (Some(dst), Some(src)) = (buf.get_mut(..n), src.get(..n)) {
            dst.copy_from_slice(src);
        }
        self.pos = self.pos.saturating_add(n);
        Ok(n)
    }
}
