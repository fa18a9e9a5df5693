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

/// Byte-stream plumbing shared by the client side, the upstream side, and the codec.
pub mod buffer_pool;
pub mod framed;

pub use buffer_pool::{BufferPool, BufferPoolMetrics, PooledBuffer, DEFAULT_BUFFER_SIZE};
pub use framed::{ErrorMode, FramedStream, StreamObserver};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex channel the proxy can frame: TCP, TLS over TCP, TLS over a tunnel.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Type-erased channel so client and upstream layers can nest without generic explosion.
pub type BoxedIo = Box<dyn Io>;

/// Framed client-side stream.
pub type ClientStream = FramedStream<BoxedIo>;

/// Decodes bytes one-to-one into chars (ISO-8859-1).
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`latin1_decode`]. Chars above U+00FF cannot appear on the wire and become `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
