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

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    io::FramedStream,
    utils::{ProtocolError, ProxyError, ProxyResult},
};

use super::compression::{Decoder, DecompressionProvider};

/// Per-copy transformation policy. Not message state: the same message may be relayed with
/// `None` and materialized with `Uncompress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    /// Preserve the wire framing. Chunked input is re-emitted as chunks.
    None,
    /// Strip chunk framing and emit raw payload bytes.
    RemoveChunked,
    /// Strip chunk framing and decode the declared content-encoding.
    Uncompress,
}

/// How a body is delimited on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyFraming {
    /// Declared length, `-1` when unknown (chunked, or delimited by connection close).
    pub content_length: i64,
    pub is_chunked: bool,
    pub content_encoding: Option<String>,
}

impl BodyFraming {
    pub fn empty() -> Self {
        Self::fixed(0)
    }

    pub fn fixed(len: u64) -> Self {
        Self {
            content_length: i64::try_from(len).unwrap_or(i64::MAX),
            is_chunked: false,
            content_encoding: None,
        }
    }

    pub fn chunked() -> Self {
        Self {
            content_length: -1,
            is_chunked: true,
            content_encoding: None,
        }
    }

    pub fn until_close() -> Self {
        Self {
            content_length: -1,
            is_chunked: false,
            content_encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.is_chunked && self.content_length == 0
    }
}

/// Sees every de-framed payload slice as it is copied.
pub type ByteObserver<'a> = &'a mut (dyn FnMut(&[u8]) + Send);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Fixed { remaining: u64 },
    UntilClose,
    ChunkHeader,
    ChunkData { remaining: u64 },
    Done,
}

/// Framing-aware reader yielding the payload of one message body.
///
/// Never pulls from the channel once the declared end has been reached, so bytes of a
/// following message stay buffered in the stream.
pub struct BodyReader<'a, S> {
    stream: &'a mut FramedStream<S>,
    state: ReadState,
}

impl<'a, S: AsyncRead + Unpin> BodyReader<'a, S> {
    pub fn new(stream: &'a mut FramedStream<S>, framing: &BodyFraming) -> Self {
        let state = if framing.is_chunked {
            ReadState::ChunkHeader
        } else if framing.content_length < 0 {
            ReadState::UntilClose
        } else if framing.content_length == 0 {
            ReadState::Done
        } else {
            ReadState::Fixed {
                remaining: framing.content_length as u64,
            }
        };
        Self { stream, state }
    }

    pub fn is_done(&self) -> bool {
        self.state == ReadState::Done
    }

    /// Reads the next payload bytes into `out`. Returns 0 once the body is complete.
    pub async fn read(&mut self, out: &mut [u8]) -> ProxyResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ReadState::Done => return Ok(0),
                ReadState::UntilClose => {
                    let n = self.stream.read(out).await?;
                    if n == 0 {
                        self.state = ReadState::Done;
                    }
                    return Ok(n);
                }
                ReadState::Fixed { remaining } => {
                    let n = self.read_bounded(out, remaining).await?;
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ReadState::Done
                    } else {
                        ReadState::Fixed { remaining }
                    };
                    return Ok(n);
                }
                ReadState::ChunkHeader => {
                    let line = self
                        .stream
                        .read_line()
                        .await?
                        .ok_or(ProtocolError::UnexpectedEof)?;
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        self.consume_trailers().await?;
                        self.state = ReadState::Done;
                        return Ok(0);
                    }
                    self.state = ReadState::ChunkData { remaining: size };
                }
                ReadState::ChunkData { remaining } => {
                    let n = self.read_bounded(out, remaining).await?;
                    let remaining = remaining - n as u64;
                    if remaining == 0 {
                        self.expect_chunk_terminator().await?;
                        self.state = ReadState::ChunkHeader;
                    } else {
                        self.state = ReadState::ChunkData { remaining };
                    }
                    return Ok(n);
                }
            }
        }
    }

    async fn read_bounded(&mut self, out: &mut [u8], remaining: u64) -> ProxyResult<usize> {
        let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(out.len());
        let n = self.stream.read(&mut out[..want]).await?;
        if n == 0 {
            return Err(ProtocolError::UnexpectedEof.into());
        }
        Ok(n)
    }

    async fn expect_chunk_terminator(&mut self) -> ProxyResult<()> {
        match self.stream.read_line().await? {
            Some(line) if line.is_empty() => Ok(()),
            Some(_) => Err(ProtocolError::UnexpectedTrailingData.into()),
            None => Err(ProtocolError::UnexpectedEof.into()),
        }
    }

    /// Trailer fields are read and dropped up to the terminating blank line.
    async fn consume_trailers(&mut self) -> ProxyResult<()> {
        while let Some(line) = self.stream.read_line().await? {
            if line.is_empty() {
                break;
            }
            tracing::trace!(trailer = %line, "dropping chunked trailer");
        }
        Ok(())
    }
}

/// Parses `hex-size [";" ext]`. Anything that is not hex is a protocol error.
pub fn parse_chunk_size(line: &str) -> ProxyResult<u64> {
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidChunkSize(line.to_string()).into());
    }
    u64::from_str_radix(size, 16)
        .map_err(|_| ProtocolError::InvalidChunkSize(line.to_string()).into())
}

/// Copies one message body from `source` to `writer`.
///
/// `on_byte_copy` sees the payload after de-framing and before decoding. Returns the number of
/// payload bytes taken from the source.
pub async fn copy_body<S, W>(
    source: &mut FramedStream<S>,
    writer: &mut W,
    mode: FramingMode,
    framing: &BodyFraming,
    decompression: &dyn DecompressionProvider,
    mut on_byte_copy: Option<ByteObserver<'_>>,
) -> ProxyResult<u64>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut decoder: Option<Box<dyn Decoder>> = match (mode, &framing.content_encoding) {
        (FramingMode::Uncompress, Some(encoding)) => {
            let decoder = decompression.decoder(encoding);
            if decoder.is_none() {
                tracing::debug!(encoding = %encoding, "no decoder for content-encoding; copying raw");
            }
            decoder
        }
        _ => None,
    };
    let rechunk = mode == FramingMode::None && framing.is_chunked;

    let mut scratch = source.buffer_pool().rent();
    let mut decoded = Vec::new();
    let mut total = 0u64;
    let mut reader = BodyReader::new(source, framing);

    loop {
        let n = reader.read(&mut scratch).await?;
        if n == 0 {
            break;
        }
        let chunk = &scratch[..n];
        total += n as u64;
        if let Some(observer) = on_byte_copy.as_deref_mut() {
            observer(chunk);
        }

        if let Some(decoder) = decoder.as_mut() {
            decoder
                .decode(chunk, &mut decoded)
                .map_err(|err| decode_error(framing, err))?;
            if !decoded.is_empty() {
                writer.write_all(&decoded).await?;
                decoded.clear();
            }
        } else if rechunk {
            writer.write_all(format!("{n:x}\r\n").as_bytes()).await?;
            writer.write_all(chunk).await?;
            writer.write_all(b"\r\n").await?;
        } else {
            writer.write_all(chunk).await?;
        }
    }

    if let Some(decoder) = decoder.as_mut() {
        decoder
            .finish(&mut decoded)
            .map_err(|err| decode_error(framing, err))?;
        if !decoded.is_empty() {
            writer.write_all(&decoded).await?;
        }
    }
    if rechunk {
        writer.write_all(b"0\r\n\r\n").await?;
    }
    writer.flush().await?;
    Ok(total)
}

fn decode_error(framing: &BodyFraming, err: std::io::Error) -> ProxyError {
    let encoding = framing.content_encoding.as_deref().unwrap_or("identity");
    ProtocolError::UnsupportedEncoding(format!("{encoding}: {err}")).into()
}

/// Drains a body without delivering it so the connection can carry the next message.
pub async fn syphon_body<S: AsyncRead + Unpin>(
    source: &mut FramedStream<S>,
    framing: &BodyFraming,
) -> ProxyResult<u64> {
    let mut scratch = source.buffer_pool().rent();
    let mut reader = BodyReader::new(source, framing);
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut scratch).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n as u64;
    }
}

/// Materializes a body in memory with chunk framing removed (and decoded for `Uncompress`).
pub async fn read_body<S: AsyncRead + Unpin>(
    source: &mut FramedStream<S>,
    framing: &BodyFraming,
    mode: FramingMode,
    decompression: &dyn DecompressionProvider,
) -> ProxyResult<Bytes> {
    let mode = match mode {
        FramingMode::None => FramingMode::RemoveChunked,
        other => other,
    };
    let mut out = Vec::with_capacity(framing.content_length.clamp(0, 1 << 20) as usize);
    copy_body(source, &mut out, mode, framing, decompression, None).await?;
    Ok(Bytes::from(out))
}

/// Writes an in-memory body, as a single chunk plus terminator when `chunked`.
pub async fn write_body<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    chunked: bool,
) -> ProxyResult<()> {
    if chunked {
        if !body.is_empty() {
            writer.write_all(format!("{:x}\r\n", body.len()).as_bytes()).await?;
            writer.write_all(body).await?;
            writer.write_all(b"\r\n").await?;
        }
        writer.write_all(b"0\r\n\r\n").await?;
    } else {
        writer.write_all(body).await?;
    }
    writer.flush().await?;
    Ok(())
}
