/* Interpose (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::utils::{ProtocolError, ProxyError, ProxyResult};

use super::{
    buffer_pool::{BufferPool, PooledBuffer},
    latin1_decode,
};

/// Longest line `read_line` accepts before failing the message.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// How a stream reacts when the channel underneath reports an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Surface the error to the caller (first handshake, fresh connections).
    Strict,
    /// Treat the error as end-of-stream. Used for pooled sockets that may already be dead.
    BestEffort,
}

/// Optional tap on raw bytes moving through a stream.
pub trait StreamObserver: Send + Sync {
    fn on_read(&self, _bytes: &[u8]) {}
    fn on_write(&self, _bytes: &[u8]) {}
}

/// Buffered, peekable duplex stream over any async byte channel.
///
/// The read side owns one pooled buffer. `start..end` is the unread window; the window is
/// compacted to the front before every refill and never grows past the buffer's capacity,
/// which makes the capacity a hard limit for peeks. Once the channel reports end-of-stream
/// the stream stays closed and later reads return immediately.
///
/// `FramedStream` is itself `AsyncRead + AsyncWrite` (buffered bytes are drained first), so
/// TLS can be layered on top of a stream that was already peeked into.
pub struct FramedStream<S> {
    inner: S,
    buffer: PooledBuffer,
    start: usize,
    end: usize,
    closed: bool,
    mode: ErrorMode,
    cancel: CancellationToken,
    read_timeout: Option<Duration>,
    observer: Option<Arc<dyn StreamObserver>>,
    line: Vec<u8>,
    max_line: usize,
}

impl<S> fmt::Debug for FramedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedStream")
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .field("closed", &self.closed)
            .field("mode", &self.mode)
            .finish()
    }
}

impl<S> FramedStream<S> {
    pub fn new(inner: S, pool: &Arc<BufferPool>) -> Self {
        Self {
            inner,
            buffer: pool.rent(),
            start: 0,
            end: 0,
            closed: false,
            mode: ErrorMode::Strict,
            cancel: CancellationToken::new(),
            read_timeout: None,
            observer: None,
            line: Vec::new(),
            max_line: DEFAULT_MAX_LINE,
        }
    }

    pub fn with_mode(mut self, mode: ErrorMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    pub fn set_read_timeout(&mut self, read_timeout: Option<Duration>) {
        self.read_timeout = read_timeout;
    }

    pub fn set_mode(&mut self, mode: ErrorMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ErrorMode {
        self.mode
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Unread bytes currently held in the buffer.
    pub fn available(&self) -> usize {
        self.end - self.start
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        self.buffer.pool()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Splits the stream into the channel and whatever was buffered but not consumed.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        let leftover = self.buffer[self.start..self.end].to_vec();
        (self.inner, leftover)
    }

    /// Drops up to `count` buffered bytes without copying them anywhere.
    pub fn consume(&mut self, count: usize) -> usize {
        let taken = count.min(self.available());
        self.start += taken;
        taken
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
            return;
        }
        self.buffer.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    fn absorb(&mut self, err: io::Error) -> ProxyResult<bool> {
        match self.mode {
            ErrorMode::BestEffort => {
                tracing::debug!(error = %err, "read failed on best-effort stream; treating as closed");
                self.closed = true;
                Ok(false)
            }
            ErrorMode::Strict => {
                self.closed = true;
                Err(err.into())
            }
        }
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Pulls more bytes from the channel. Returns `false` once the stream has ended.
    ///
    /// Honors the stream's cancellation token; a cancelled fill leaves the buffer intact.
    pub async fn fill(&mut self) -> ProxyResult<bool> {
        if self.closed {
            return Ok(false);
        }
        self.compact();
        if self.end == self.buffer.len() {
            return Ok(true);
        }

        let cancel = self.cancel.clone();
        let read_timeout = self.read_timeout;
        let end = self.end;
        let read = {
            let slot = &mut self.buffer[end..];
            let inner = &mut self.inner;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                res = read_with_deadline(inner, slot, read_timeout) => res,
            }
        };

        match read {
            Ok(0) => {
                self.closed = true;
                Ok(false)
            }
            Ok(n) => {
                if let Some(observer) = &self.observer {
                    observer.on_read(&self.buffer[end..end + n]);
                }
                self.end += n;
                Ok(true)
            }
            Err(err) => self.absorb(err),
        }
    }

    /// Returns the byte `index` positions ahead of the read cursor without consuming it.
    ///
    /// `Ok(None)` means the stream ended first.
    pub async fn peek_byte(&mut self, index: usize) -> ProxyResult<Option<u8>> {
        self.ensure_window(index + 1).await?;
        if self.available() <= index {
            return Ok(None);
        }
        Ok(Some(self.buffer[self.start + index]))
    }

    /// Returns `len` bytes starting `index` positions ahead of the cursor, or `None` when the
    /// stream ends before that many bytes arrive.
    pub async fn peek_bytes(&mut self, index: usize, len: usize) -> ProxyResult<Option<&[u8]>> {
        let needed = index + len;
        self.ensure_window(needed).await?;
        if self.available() < needed {
            return Ok(None);
        }
        let from = self.start + index;
        Ok(Some(&self.buffer[from..from + len]))
    }

    async fn ensure_window(&mut self, needed: usize) -> ProxyResult<()> {
        let capacity = self.capacity();
        if needed > capacity {
            return Err(ProtocolError::PeekOutOfRange {
                requested: needed,
                capacity,
            }
            .into());
        }
        while self.available() < needed {
            if !self.fill().await? {
                break;
            }
        }
        Ok(())
    }

    pub async fn read_byte(&mut self) -> ProxyResult<Option<u8>> {
        if self.available() == 0 && !self.fill().await? {
            return Ok(None);
        }
        let byte = self.buffer[self.start];
        self.start += 1;
        Ok(Some(byte))
    }

    /// Copies buffered bytes into `out`, refilling once if the buffer is empty.
    /// Returns 0 at end of stream.
    pub async fn read(&mut self, out: &mut [u8]) -> ProxyResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.available() == 0 && !self.fill().await? {
            return Ok(0);
        }
        let n = self.available().min(out.len());
        out[..n].copy_from_slice(&self.buffer[self.start..self.start + n]);
        self.start += n;
        Ok(n)
    }

    /// Reads one `\n`-terminated line, dropping the terminator and a preceding `\r`.
    ///
    /// Bytes are decoded one-to-one (Latin-1) so arbitrary header bytes survive a
    /// decode/encode round trip. Returns `None` if the stream ends before any byte arrives.
    pub async fn read_line(&mut self) -> ProxyResult<Option<String>> {
        let mut line = std::mem::take(&mut self.line);
        line.clear();
        let result = self.read_line_into(&mut line).await;
        let decoded = match result {
            Ok(true) => Ok(Some(latin1_decode(&line))),
            Ok(false) => Ok(None),
            Err(err) => Err(err),
        };
        if line.capacity() > 4 * self.capacity() {
            line = Vec::new();
        }
        self.line = line;
        decoded
    }

    async fn read_line_into(&mut self, line: &mut Vec<u8>) -> ProxyResult<bool> {
        loop {
            if self.available() == 0 && !self.fill().await? {
                return Ok(!line.is_empty());
            }

            let window = &self.buffer[self.start..self.end];
            let newline = window.iter().position(|b| *b == b'\n');
            let take = newline.map_or(window.len(), |pos| pos);
            if line.capacity() - line.len() < take {
                let grow = line.capacity().max(take).max(self.buffer.len());
                line.reserve(grow);
            }
            line.extend_from_slice(&window[..take]);

            match newline {
                Some(pos) => {
                    self.start += pos + 1;
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    return Ok(true);
                }
                None => {
                    self.start = self.end;
                    if line.len() > self.max_line {
                        return Err(ProtocolError::LineTooLong(self.max_line).into());
                    }
                }
            }
        }
    }

    /// Reads until the channel ends, discarding everything. Returns the byte count.
    pub async fn drain_to_end(&mut self) -> ProxyResult<u64> {
        let mut total = self.available() as u64;
        self.start = self.end;
        while self.fill().await? {
            total += self.available() as u64;
            self.start = self.end;
        }
        Ok(total)
    }
}

async fn read_with_deadline<S: AsyncRead + Unpin>(
    inner: &mut S,
    slot: &mut [u8],
    deadline: Option<Duration>,
) -> io::Result<usize> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, inner.read(slot)).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("read timed out after {limit:?}"),
            )),
        },
        None => inner.read(slot).await,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for FramedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.available() > 0 {
            let n = this.available().min(buf.remaining());
            buf.put_slice(&this.buffer[this.start..this.start + n]);
            this.start += n;
            return Poll::Ready(Ok(()));
        }
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match ready!(Pin::new(&mut this.inner).poll_read(cx, buf)) {
            Ok(()) => {
                let fresh = &buf.filled()[before..];
                if fresh.is_empty() {
                    this.closed = true;
                } else if let Some(observer) = &this.observer {
                    observer.on_read(fresh);
                }
                Poll::Ready(Ok(()))
            }
            Err(err) if this.mode == ErrorMode::BestEffort => {
                tracing::debug!(error = %err, "read failed on best-effort stream; treating as closed");
                this.closed = true;
                Poll::Ready(Ok(()))
            }
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FramedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_write(cx, buf)) {
            Ok(n) => {
                if let Some(observer) = &this.observer {
                    observer.on_write(&buf[..n]);
                }
                Poll::Ready(Ok(n))
            }
            Err(err) => {
                if this.mode == ErrorMode::BestEffort {
                    this.closed = true;
                }
                Poll::Ready(Err(err))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_flush(cx)) {
            Err(err) if this.mode == ErrorMode::BestEffort => {
                tracing::debug!(error = %err, "flush failed on best-effort stream");
                this.closed = true;
                Poll::Ready(Ok(()))
            }
            other => Poll::Ready(other),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_shutdown(cx)) {
            Err(err) if this.mode == ErrorMode::BestEffort => {
                tracing::debug!(error = %err, "shutdown failed on best-effort stream");
                Poll::Ready(Ok(()))
            }
            other => Poll::Ready(other),
        }
    }
}
