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
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    time::Instant,
};
use tokio_rustls::client::TlsStream;

use crate::io::{BufferPool, ErrorMode, FramedStream};

use super::key::ConnectionCacheKey;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Socket toward an origin (or through a tunnel to one).
pub enum ServerStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ServerStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            ServerStream::Plain(tcp) => tcp,
            ServerStream::Tls(tls) => tls.get_ref().0,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ServerStream::Tls(_))
    }

    pub fn negotiated_alpn(&self) -> Option<String> {
        match self {
            ServerStream::Plain(_) => None,
            ServerStream::Tls(tls) => tls
                .get_ref()
                .1
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        }
    }

    /// Non-blocking check that the peer has neither closed nor sent unsolicited bytes.
    pub fn probe_alive(&self) -> bool {
        let mut byte = [0u8; 1];
        match self.tcp().peek(&mut byte).now_or_never() {
            None => true,
            Some(Ok(_)) => false,
            Some(Err(err)) => err.kind() == io::ErrorKind::WouldBlock,
        }
    }
}

impl fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStream::Plain(_) => f.write_str("ServerStream::Plain"),
            ServerStream::Tls(_) => f.write_str("ServerStream::Tls"),
        }
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Milestones of connection establishment, as offsets from the first attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionTimings {
    pub dns_resolved: Option<Duration>,
    pub tcp_connected: Option<Duration>,
    pub tunnel_established: Option<Duration>,
    pub tls_established: Option<Duration>,
}

/// An upstream connection plus the bookkeeping the pool needs to decide on reuse.
pub struct PooledConnection {
    id: u64,
    key: ConnectionCacheKey,
    stream: FramedStream<ServerStream>,
    remote_addr: SocketAddr,
    negotiated_alpn: Option<String>,
    timings: ConnectionTimings,
    created_at: Instant,
    last_used: Instant,
    uses: u32,
    auth_tainted: bool,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("remote_addr", &self.remote_addr)
            .field("uses", &self.uses)
            .field("auth_tainted", &self.auth_tainted)
            .finish()
    }
}

impl PooledConnection {
    pub fn new(
        key: ConnectionCacheKey,
        stream: ServerStream,
        buffers: &Arc<BufferPool>,
        remote_addr: SocketAddr,
        timings: ConnectionTimings,
    ) -> Self {
        let negotiated_alpn = stream.negotiated_alpn();
        let now = Instant::now();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            stream: FramedStream::new(stream, buffers),
            remote_addr,
            negotiated_alpn,
            timings,
            created_at: now,
            last_used: now,
            uses: 0,
            auth_tainted: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &ConnectionCacheKey {
        &self.key
    }

    pub fn stream(&mut self) -> &mut FramedStream<ServerStream> {
        &mut self.stream
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn negotiated_alpn(&self) -> Option<&str> {
        self.negotiated_alpn.as_deref()
    }

    pub fn timings(&self) -> &ConnectionTimings {
        &self.timings
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// How many times this connection has been handed out.
    pub fn uses(&self) -> u32 {
        self.uses
    }

    pub fn is_reused(&self) -> bool {
        self.uses > 1
    }

    pub fn is_auth_tainted(&self) -> bool {
        self.auth_tainted
    }

    /// Connection-scoped authentication (NTLM, Negotiate) binds the socket to one client.
    pub fn taint_auth(&mut self) {
        self.auth_tainted = true;
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Marks a hand-out. Reused sockets may be dead, so reads no longer surface errors
    /// as hard failures.
    pub(crate) fn checkout(&mut self) {
        self.uses += 1;
        let mode = if self.uses > 1 {
            ErrorMode::BestEffort
        } else {
            ErrorMode::Strict
        };
        self.stream.set_mode(mode);
    }

    /// True when the connection sat idle no longer than `max_idle`.
    pub(crate) fn is_fresh(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_used) < max_idle
    }

    /// Idle pooled sockets must have nothing buffered and a live peer.
    pub(crate) fn probe_alive(&self) -> bool {
        !self.stream.is_closed() && self.stream.available() == 0 && self.stream.get_ref().probe_alive()
    }

    pub(crate) async fn shutdown(mut self) {
        if let Err(err) = self.stream.get_mut().shutdown().await {
            tracing::trace!(id = self.id, error = %err, "upstream shutdown error");
        }
    }
}
