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

use tokio::io::AsyncRead;

use crate::{io::FramedStream, utils::ProxyResult};

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

/// Fields of a ClientHello the proxy needs before deciding whether to intercept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    /// `0x0002` for an SSLv2-framed hello, otherwise the legacy `client_version`.
    pub version: u16,
    /// Highest entry of `supported_versions`, when the extension is present.
    pub max_supported_version: Option<u16>,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub cipher_suites: Vec<u16>,
    pub extensions: Vec<u16>,
}

impl ClientHello {
    pub fn is_sslv2(&self) -> bool {
        self.version == 0x0002
    }

    pub fn offers_alpn(&self, protocol: &str) -> bool {
        self.alpn.iter().any(|p| p == protocol)
    }
}

/// Looks at the first bytes without consuming anything. True for both SSLv2 and SSLv3/TLS
/// record layouts.
pub async fn looks_like_tls<S: AsyncRead + Unpin>(
    stream: &mut FramedStream<S>,
) -> ProxyResult<bool> {
    let Some(head) = stream.peek_bytes(0, 3).await? else {
        return Ok(false);
    };
    Ok(is_tls_record_start(head) || is_sslv2_hello_start(head))
}

fn is_tls_record_start(head: &[u8]) -> bool {
    head.len() >= 3 && head[0] == RECORD_HANDSHAKE && head[1] == 3 && head[2] <= 4
}

fn is_sslv2_hello_start(head: &[u8]) -> bool {
    head.len() >= 3 && head[0] & 0x80 != 0 && head[2] == HANDSHAKE_CLIENT_HELLO
}

/// Peeks the full ClientHello (bounded by the stream's buffer capacity) and parses it.
///
/// Returns `None` for non-TLS traffic or a hello that cannot be parsed. The stream position
/// is unchanged either way, so the handshake can run over the same bytes.
pub async fn peek_client_hello<S: AsyncRead + Unpin>(
    stream: &mut FramedStream<S>,
) -> ProxyResult<Option<ClientHello>> {
    let Some(head) = stream.peek_bytes(0, 5).await? else {
        return Ok(None);
    };
    let total = if is_tls_record_start(head) {
        5 + usize::from(u16::from_be_bytes([head[3], head[4]]))
    } else if is_sslv2_hello_start(head) {
        2 + (usize::from(head[0] & 0x7f) << 8 | usize::from(head[1]))
    } else {
        return Ok(None);
    };
    let want = total.min(stream.capacity());
    let Some(bytes) = stream.peek_bytes(0, want).await? else {
        return Ok(None);
    };
    Ok(parse_client_hello(bytes))
}

/// Parses a ClientHello from the start of a TLS record or an SSLv2 hello.
pub fn parse_client_hello(bytes: &[u8]) -> Option<ClientHello> {
    if is_tls_record_start(bytes) {
        parse_tls_hello(bytes.get(5..)?)
    } else if is_sslv2_hello_start(bytes) {
        parse_sslv2_hello(bytes.get(2..)?)
    } else {
        None
    }
}

fn parse_sslv2_hello(body: &[u8]) -> Option<ClientHello> {
    let mut r = Cursor::new(body);
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _version = r.u16()?;
    let cipher_len = usize::from(r.u16()?);
    let _session_len = r.u16()?;
    let _challenge_len = r.u16()?;
    let specs = r.take(cipher_len)?;
    let cipher_suites = specs
        .chunks_exact(3)
        .filter(|spec| spec[0] == 0)
        .map(|spec| u16::from_be_bytes([spec[1], spec[2]]))
        .collect();
    Some(ClientHello {
        version: 0x0002,
        cipher_suites,
        ..ClientHello::default()
    })
}

fn parse_tls_hello(body: &[u8]) -> Option<ClientHello> {
    let mut r = Cursor::new(body);
    if r.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let _length = r.u24()?;
    let mut hello = ClientHello {
        version: r.u16()?,
        ..ClientHello::default()
    };
    r.take(32)?;
    let session_len = usize::from(r.u8()?);
    r.take(session_len)?;

    let suites_len = usize::from(r.u16()?);
    hello.cipher_suites = r
        .take(suites_len)?
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    let compression_len = usize::from(r.u8()?);
    r.take(compression_len)?;

    // Extensions are optional; a hello truncated here still identifies as TLS.
    let Some(ext_len) = r.u16() else {
        return Some(hello);
    };
    let Some(extensions) = r.take(usize::from(ext_len)).or_else(|| r.rest()) else {
        return Some(hello);
    };
    let mut ext = Cursor::new(extensions);
    while let (Some(kind), Some(len)) = (ext.u16(), ext.u16()) {
        let Some(data) = ext.take(usize::from(len)) else {
            break;
        };
        hello.extensions.push(kind);
        match kind {
            EXT_SERVER_NAME => hello.sni = parse_server_name(data),
            EXT_ALPN => hello.alpn = parse_alpn(data).unwrap_or_default(),
            EXT_SUPPORTED_VERSIONS => hello.max_supported_version = parse_versions(data),
            _ => {}
        }
    }
    Some(hello)
}

fn parse_server_name(data: &[u8]) -> Option<String> {
    let mut r = Cursor::new(data);
    let list_len = usize::from(r.u16()?);
    let mut list = Cursor::new(r.take(list_len)?);
    while let Some(kind) = list.u8() {
        let len = usize::from(list.u16()?);
        let name = list.take(len)?;
        if kind == 0 {
            let name = std::str::from_utf8(name).ok()?;
            return Some(name.trim_end_matches('.').to_ascii_lowercase());
        }
    }
    None
}

fn parse_alpn(data: &[u8]) -> Option<Vec<String>> {
    let mut r = Cursor::new(data);
    let list_len = usize::from(r.u16()?);
    let mut list = Cursor::new(r.take(list_len)?);
    let mut protocols = Vec::new();
    while let Some(len) = list.u8() {
        let proto = list.take(usize::from(len))?;
        protocols.push(String::from_utf8_lossy(proto).into_owned());
    }
    Some(protocols)
}

fn parse_versions(data: &[u8]) -> Option<u16> {
    let mut r = Cursor::new(data);
    let len = usize::from(r.u8()?);
    r.take(len)?
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        // GREASE values (0x?a?a) are not real versions.
        .filter(|v| v & 0x0f0f != 0x0a0a)
        .max()
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn rest(&mut self) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..)?;
        self.pos = self.data.len();
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<u32> {
        self.take(3)
            .map(|b| u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}
