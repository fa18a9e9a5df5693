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
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use http::{Method, Version};
use interpose::http::{
    copy_body, read_body, read_request, write_body, write_request_head, BodyFraming,
    DefaultDecompression, FramingMode, HttpMessage,
};
use interpose::io::{BufferPool, FramedStream, StreamObserver};
use tokio::io::AsyncWriteExt;

const BUFFER: usize = 16;

#[derive(Default)]
struct ReadCounter(AtomicUsize);

impl StreamObserver for ReadCounter {
    fn on_read(&self, bytes: &[u8]) {
        self.0.fetch_add(bytes.len(), Ordering::Relaxed);
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

#[tokio::test]
async fn chunked_bodies_survive_a_round_trip() {
    let pool = BufferPool::new(BUFFER, 4);
    for len in [0, 1, BUFFER, BUFFER * 3 + 5] {
        let body = payload(len);
        let mut wire = Vec::new();
        write_body(&mut wire, &body, true).await.unwrap();

        let mut stream = FramedStream::new(wire.as_slice(), &pool);
        let decoded = read_body(
            &mut stream,
            &BodyFraming::chunked(),
            FramingMode::RemoveChunked,
            &DefaultDecompression,
        )
        .await
        .unwrap();
        assert_eq!(decoded.as_ref(), body.as_slice(), "length {len}");
        assert!(stream.buffered().is_empty());
    }
}

#[tokio::test]
async fn fixed_length_body_never_reads_past_its_end() {
    let pool = BufferPool::new(BUFFER, 4);
    for len in [0, 1, BUFFER, BUFFER + 1] {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let counter = Arc::new(ReadCounter::default());
        let mut stream = FramedStream::new(reader, &pool).with_observer(counter.clone());

        let body = payload(len);
        writer.write_all(&body).await.unwrap();

        // The writer stays open: a read beyond the declared length would block forever.
        let mut out = Vec::new();
        let copied = tokio::time::timeout(
            Duration::from_secs(5),
            copy_body(
                &mut stream,
                &mut out,
                FramingMode::None,
                &BodyFraming::fixed(len as u64),
                &DefaultDecompression,
                None,
            ),
        )
        .await
        .expect("body copy stalled")
        .unwrap();

        assert_eq!(copied, len as u64);
        assert_eq!(out, body);
        assert_eq!(counter.0.load(Ordering::Relaxed), len);
        drop(writer);
    }
}

#[tokio::test]
async fn request_head_keeps_repeated_headers_in_order() {
    let raw = b"POST /upload?x=1 HTTP/1.1\r\n\
Host: example.com\r\n\
Accept: text/html\r\n\
X-Trace: one\r\n\
Accept: application/json\r\n\
Content-Length: 5\r\n\
\r\n\
hello";
    let pool = BufferPool::new(256, 2);
    let mut stream = FramedStream::new(&raw[..], &pool);
    let mut request = read_request(&mut stream).await.unwrap().unwrap();

    assert_eq!(request.method(), &Method::POST);
    assert_eq!(request.target(), "/upload?x=1");
    assert_eq!(request.version(), Version::HTTP_11);
    let accepts: Vec<_> = request.headers().get_all("accept").collect();
    assert_eq!(accepts, ["text/html", "application/json"]);

    let framing = request.framing().unwrap();
    assert_eq!(framing.content_length, 5);
    let body = read_body(&mut stream, &framing, FramingMode::None, &DefaultDecompression)
        .await
        .unwrap();
    assert_eq!(body.as_ref(), b"hello");

    let mut written = Vec::new();
    write_request_head(&mut written, &mut request).await.unwrap();
    assert_eq!(written, &raw[..raw.len() - 5]);
    assert!(request.is_locked());
}

#[tokio::test]
async fn single_chunk_body_decodes() {
    let raw: &[u8] = b"1\r\na\r\n0\r\n\r\n";
    let pool = BufferPool::new(BUFFER, 2);
    let mut stream = FramedStream::new(raw, &pool);
    let body = read_body(
        &mut stream,
        &BodyFraming::chunked(),
        FramingMode::None,
        &DefaultDecompression,
    )
    .await
    .unwrap();
    assert_eq!(body.as_ref(), b"a");
}

#[tokio::test]
async fn pipelined_requests_stay_separate() {
    let raw: &[u8] = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
    let pool = BufferPool::new(256, 2);
    let mut stream = FramedStream::new(raw, &pool);
    let first = read_request(&mut stream).await.unwrap().unwrap();
    assert!(!first.has_body().unwrap());
    let second = read_request(&mut stream).await.unwrap().unwrap();
    assert_eq!(first.target(), "/a");
    assert_eq!(second.target(), "/b");
    assert!(read_request(&mut stream).await.unwrap().is_none());
}

#[tokio::test]
async fn uncompress_mode_decodes_a_chunked_gzip_body() {
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    let plain = payload(BUFFER * 20);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&plain).unwrap();
    let compressed = encoder.finish().unwrap();

    // Several chunks so the decoder sees the stream in pieces.
    let mut wire = Vec::new();
    for piece in compressed.chunks(BUFFER + 3) {
        wire.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
        wire.extend_from_slice(piece);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0\r\n\r\n");

    let mut framing = BodyFraming::chunked();
    framing.content_encoding = Some("gzip".into());
    let pool = BufferPool::new(BUFFER, 4);
    let mut stream = FramedStream::new(wire.as_slice(), &pool);
    let mut observed = 0usize;
    let mut observe = |bytes: &[u8]| observed += bytes.len();
    let observer: interpose::http::ByteObserver<'_> = &mut observe;
    let mut out = Vec::new();
    let taken = copy_body(
        &mut stream,
        &mut out,
        FramingMode::Uncompress,
        &framing,
        &DefaultDecompression,
        Some(observer),
    )
    .await
    .unwrap();

    assert_eq!(out, plain);
    assert_eq!(taken, compressed.len() as u64);
    assert_eq!(observed, compressed.len());
}
