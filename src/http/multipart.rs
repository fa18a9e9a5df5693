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

use crate::io::latin1_decode;

use super::headers::HeaderCollection;

/// Bytes of scan context kept when the window is compacted.
const KEEP_TAIL: usize = 100;
/// Part header blocks larger than this are abandoned.
const MAX_PART_HEADERS: usize = 16 * 1024;

/// Extracts the `boundary` parameter of a `multipart/form-data` content type.
pub fn form_data_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media = params.next()?.trim();
    if !media.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    /// Just matched `--boundary`; `first` holds the byte after it, if seen.
    AfterBoundary { first: Option<u8> },
    Headers,
    Finished,
}

/// Push-based part-boundary scanner for `multipart/form-data` bodies.
///
/// Bytes are fed in whatever slices the body copy produces. A rolling window is checked for
/// `--<boundary>` after every byte; the window is compacted once it grows past
/// `marker + 4 + KEEP_TAIL`, keeping the last `KEEP_TAIL` bytes so a marker split across two
/// feeds is still found.
pub struct MultipartScanner {
    marker: Vec<u8>,
    window: Vec<u8>,
    state: ScanState,
    header_block: Vec<u8>,
    parts: usize,
}

impl MultipartScanner {
    pub fn new(boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self {
            window: Vec::with_capacity(marker.len() + 4 + KEEP_TAIL),
            marker,
            state: ScanState::Scanning,
            header_block: Vec::new(),
            parts: 0,
        }
    }

    /// Parts whose header block has been reported so far.
    pub fn parts(&self) -> usize {
        self.parts
    }

    pub fn is_finished(&self) -> bool {
        self.state == ScanState::Finished
    }

    /// Scans `bytes`, calling `on_part(index, headers)` for every complete part header block.
    pub fn feed(&mut self, bytes: &[u8], on_part: &mut dyn FnMut(usize, &HeaderCollection)) {
        for &byte in bytes {
            match self.state {
                ScanState::Finished => return,
                ScanState::Scanning => self.scan(byte),
                ScanState::AfterBoundary { first: None } => {
                    self.state = ScanState::AfterBoundary { first: Some(byte) };
                }
                ScanState::AfterBoundary { first: Some(first) } => match (first, byte) {
                    (b'-', b'-') => self.state = ScanState::Finished,
                    (b'\r', b'\n') => {
                        self.header_block.clear();
                        self.state = ScanState::Headers;
                    }
                    _ => {
                        self.state = ScanState::Scanning;
                        self.scan(first);
                        self.scan(byte);
                    }
                },
                ScanState::Headers => {
                    self.header_block.push(byte);
                    if self.header_block.ends_with(b"\r\n\r\n") || self.header_block == b"\r\n" {
                        let headers = parse_part_headers(&self.header_block);
                        on_part(self.parts, &headers);
                        self.parts += 1;
                        self.header_block.clear();
                        self.state = ScanState::Scanning;
                    } else if self.header_block.len() > MAX_PART_HEADERS {
                        tracing::debug!(part = self.parts, "multipart header block too large; skipping part");
                        self.header_block.clear();
                        self.state = ScanState::Scanning;
                    }
                }
            }
        }
    }

    fn scan(&mut self, byte: u8) {
        self.window.push(byte);
        if self.window.ends_with(&self.marker) {
            self.window.clear();
            self.state = ScanState::AfterBoundary { first: None };
            return;
        }
        if self.window.len() >= self.marker.len() + 4 + KEEP_TAIL {
            let keep = KEEP_TAIL.max(self.marker.len());
            let cut = self.window.len() - keep;
            self.window.drain(..cut);
        }
    }
}

fn parse_part_headers(block: &[u8]) -> HeaderCollection {
    let text = latin1_decode(block);
    text.split("\r\n")
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| super::headers::HttpHeader::new(name.trim(), value.trim()))
        .collect()
}
