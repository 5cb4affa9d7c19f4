//! Buffered channel I/O over the two halves of a socket.
//!
//! [`ReadBuffer`] frames backend messages, topping up from the socket only
//! when the bytes a field needs are not buffered yet. [`WriteBuffer`]
//! accumulates frontend messages and flushes when the next message does not
//! fit, remembering whether a flush happened inside the current batch.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::error::{PgError, PgResult};
use crate::metrics::COUNTERS;
use crate::protocol::{BackendMessage, FrontendMessage};

/// Default buffer sizes, matching a typical socket buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 8 * 1024;

/// Largest backend frame accepted before the stream is treated as corrupt.
pub const MAX_MESSAGE_SIZE: usize = 1 << 30;

// ============================================================================
// Read side
// ============================================================================

pub struct ReadBuffer<R = OwnedReadHalf> {
    stream: R,
    buf: BytesMut,
    max_message_size: usize,
}

impl<R: AsyncRead + Unpin> ReadBuffer<R> {
    pub fn new(stream: R) -> Self {
        Self::with_capacity(stream, DEFAULT_READ_BUFFER_SIZE)
    }

    pub fn with_capacity(stream: R, capacity: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(capacity),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    pub fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Bytes buffered but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Make sure at least `n` bytes are buffered.
    pub async fn ensure(&mut self, n: usize) -> PgResult<()> {
        while self.buf.len() < n {
            self.buf.reserve(n - self.buf.len());
            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(PgError::ConnectionClosed);
            }
            COUNTERS.record_bytes_read(read);
        }
        Ok(())
    }

    /// Read and decode the next backend message.
    pub async fn read_message(&mut self) -> PgResult<BackendMessage> {
        self.ensure(5).await?;
        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);

        // The length includes itself
        if len < 4 || len as usize > self.max_message_size {
            return Err(PgError::protocol(format!(
                "Invalid length {} for message '{}'",
                len, tag as char
            )));
        }

        let total = 1 + len as usize;
        self.ensure(total).await?;

        let mut frame = self.buf.split_to(total);
        let body = frame.split_off(5).freeze();
        BackendMessage::decode(tag, body)
    }
}

// ============================================================================
// Write side
// ============================================================================

pub struct WriteBuffer<W = OwnedWriteHalf> {
    stream: W,
    buf: BytesMut,
    capacity: usize,
    flushed_in_batch: bool,
}

impl<W: AsyncWrite + Unpin> WriteBuffer<W> {
    pub fn new(stream: W) -> Self {
        Self::with_capacity(stream, DEFAULT_WRITE_BUFFER_SIZE)
    }

    pub fn with_capacity(stream: W, capacity: usize) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            flushed_in_batch: false,
        }
    }

    /// Bytes written but not yet flushed to the socket.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn space_left(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Start a new batch; clears the flush marker.
    pub fn begin_batch(&mut self) {
        self.flushed_in_batch = false;
    }

    /// Whether any bytes of the current batch already reached the socket.
    pub fn flush_occurred(&self) -> bool {
        self.flushed_in_batch
    }

    /// Buffer one message, flushing first when it does not fit.
    ///
    /// A message larger than the whole buffer grows it for that one message.
    pub async fn write_message<M: FrontendMessage + ?Sized>(&mut self, msg: &M) -> PgResult<()> {
        let len = msg.length();
        if len > self.space_left() && !self.buf.is_empty() {
            self.flush_buffer().await?;
            self.flushed_in_batch = true;
        }

        self.buf.reserve(len);
        let before = self.buf.len();
        msg.write(&mut self.buf);
        debug_assert_eq!(self.buf.len() - before, len, "message length mismatch");
        Ok(())
    }

    /// Write everything buffered to the socket.
    pub async fn flush(&mut self) -> PgResult<()> {
        if !self.buf.is_empty() {
            self.flush_buffer().await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn flush_buffer(&mut self) -> PgResult<()> {
        self.stream.write_all(&self.buf).await?;
        COUNTERS.record_bytes_written(self.buf.len());
        self.buf.clear();
        if self.buf.capacity() > self.capacity * 4 {
            // Shrink back after an oversized message
            self.buf = BytesMut::with_capacity(self.capacity);
        }
        Ok(())
    }

    /// Drop unflushed bytes, e.g. after a failed batch.
    pub fn discard(&mut self) {
        self.buf.clear();
    }

    pub async fn shutdown(&mut self) -> PgResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
