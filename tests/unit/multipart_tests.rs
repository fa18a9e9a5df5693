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

use interpose::http::{
    copy_body, form_data_boundary, BodyFraming, ByteObserver, DefaultDecompression, FramingMode,
    MultipartScanner,
};
use interpose::io::{BufferPool, FramedStream};

const BODY: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"a\"\r\n\
\r\n\
hello\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"b\"; filename=\"f.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
file body\r\n\
--XyZ--\r\n";

#[tokio::test]
async fn boundaries_split_across_reads_are_found() {
    let boundary = form_data_boundary("multipart/form-data; boundary=XyZ").unwrap();
    let mut scanner = MultipartScanner::new(&boundary);
    let mut parts = Vec::new();

    // Seven-byte buffers force the markers to straddle reads.
    let pool = BufferPool::new(7, 4);
    let mut stream = FramedStream::new(BODY, &pool);
    let mut forwarded = Vec::new();
    let mut observe = |bytes: &[u8]| {
        scanner.feed(bytes, &mut |index, headers| {
            parts.push((
                index,
                headers.get_first("Content-Disposition").unwrap_or("").to_string(),
            ));
        });
    };
    let observer: ByteObserver<'_> = &mut observe;
    copy_body(
        &mut stream,
        &mut forwarded,
        FramingMode::None,
        &BodyFraming::fixed(BODY.len() as u64),
        &DefaultDecompression,
        Some(observer),
    )
    .await
    .unwrap();

    assert_eq!(forwarded, BODY);
    assert!(scanner.is_finished());
    assert_eq!(scanner.parts(), 2);
    assert_eq!(parts[0], (0, "form-data; name=\"a\"".to_string()));
    assert!(parts[1].1.contains("filename=\"f.txt\""));
}

#[tokio::test]
async fn long_parts_compact_the_scan_window() {
    // With 1004 filler bytes the window compacts right after `--X` of the second marker.
    let filler = vec![b'x'; 1004];
    let mut body = Vec::new();
    body.extend_from_slice(b"--XyZ\r\nContent-Disposition: form-data; name=\"big\"\r\n\r\n");
    body.extend_from_slice(&filler);
    body.extend_from_slice(b"\r\n--XyZ\r\nContent-Disposition: form-data; name=\"tail\"\r\n\r\n");
    body.extend_from_slice(&filler);
    body.extend_from_slice(b"\r\n--XyZ--\r\n");

    let mut scanner = MultipartScanner::new("XyZ");
    let mut names = Vec::new();
    let pool = BufferPool::new(13, 4);
    let mut stream = FramedStream::new(body.as_slice(), &pool);
    let mut forwarded = Vec::new();
    let mut observe = |bytes: &[u8]| {
        scanner.feed(bytes, &mut |index, headers| {
            names.push((
                index,
                headers.get_first("Content-Disposition").unwrap_or("").to_string(),
            ));
        });
    };
    let observer: ByteObserver<'_> = &mut observe;
    copy_body(
        &mut stream,
        &mut forwarded,
        FramingMode::None,
        &BodyFraming::fixed(body.len() as u64),
        &DefaultDecompression,
        Some(observer),
    )
    .await
    .unwrap();

    assert_eq!(forwarded, body);
    assert!(scanner.is_finished());
    assert_eq!(scanner.parts(), 2);
    assert_eq!(names[0], (0, "form-data; name=\"big\"".to_string()));
    assert_eq!(names[1], (1, "form-data; name=\"tail\"".to_string()));
}
