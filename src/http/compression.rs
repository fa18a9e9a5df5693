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
    io::{self, Write},
    sync::Arc,
};

use flate2::write::{GzDecoder, ZlibDecoder};
use parking_lot::Mutex;

/// Incremental decoder fed with encoded body bytes as they come off the wire.
pub trait Decoder: Send {
    /// Decodes `input` and appends whatever plaintext is ready to `out`.
    fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()>;

    /// Flushes the tail of the stream into `out`.
    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()>;
}

/// Lookup from a `Content-Encoding` token to a decoder.
pub trait DecompressionProvider: Send + Sync {
    /// `None` means the encoding is not supported and the body must be passed through as-is.
    fn decoder(&self, encoding: &str) -> Option<Box<dyn Decoder>>;
}

/// gzip, deflate (zlib-wrapped), and br.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDecompression;

impl DecompressionProvider for DefaultDecompression {
    fn decoder(&self, encoding: &str) -> Option<Box<dyn Decoder>> {
        let sink = Sink::default();
        match encoding.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Box::new(WriteDecoder {
                inner: GzDecoder::new(sink.clone()),
                sink,
            })),
            "deflate" => Some(Box::new(WriteDecoder {
                inner: ZlibDecoder::new(sink.clone()),
                sink,
            })),
            "br" => Some(Box::new(WriteDecoder {
                inner: brotli::DecompressorWriter::new(sink.clone(), 4096),
                sink,
            })),
            _ => None,
        }
    }
}

pub fn default_provider() -> Arc<dyn DecompressionProvider> {
    Arc::new(DefaultDecompression)
}

/// Shared output vector the write-side decoders emit into.
#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn drain_into(&self, out: &mut Vec<u8>) {
        out.append(&mut self.0.lock());
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

trait FinishWrite: Write + Send {
    fn finish_stream(&mut self) -> io::Result<()>;
}

impl FinishWrite for GzDecoder<Sink> {
    fn finish_stream(&mut self) -> io::Result<()> {
        self.try_finish()
    }
}

impl FinishWrite for ZlibDecoder<Sink> {
    fn finish_stream(&mut self) -> io::Result<()> {
        self.try_finish()
    }
}

impl FinishWrite for brotli::DecompressorWriter<Sink> {
    fn finish_stream(&mut self) -> io::Result<()> {
        self.flush()
    }
}

struct WriteDecoder<W> {
    inner: W,
    sink: Sink,
}

impl<W: FinishWrite> Decoder for WriteDecoder<W> {
    fn decode(&mut self, input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
        self.inner.write_all(input)?;
        self.sink.drain_into(out);
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        self.inner.finish_stream()?;
        self.sink.drain_into(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};

    #[test]
    fn gzip_decodes_across_split_input() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"interposed body").unwrap();
        let encoded = encoder.finish().unwrap();

        let mut decoder = DefaultDecompression.decoder("GZIP").unwrap();
        let mut out = Vec::new();
        let (a, b) = encoded.split_at(7);
        decoder.decode(a, &mut out).unwrap();
        decoder.decode(b, &mut out).unwrap();
        decoder.finish(&mut out).unwrap();
        assert_eq!(out, b"interposed body");
    }

    #[test]
    fn unknown_encoding_has_no_decoder() {
        assert!(DefaultDecompression.decoder("zstd").is_none());
        assert!(DefaultDecompression.decoder("br").is_some());
    }
}
