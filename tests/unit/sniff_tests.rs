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

use std::sync::Arc;

use interpose::io::{BufferPool, FramedStream};
use interpose::tls::{looks_like_tls, peek_client_hello};
use rustls::{
    crypto::aws_lc_rs, pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore,
};

fn client_hello_bytes(server_name: &str, alpn: &[&[u8]]) -> Vec<u8> {
    let mut config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    let mut conn = ClientConnection::new(Arc::new(config), name).unwrap();
    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out).unwrap();
    }
    out
}

#[tokio::test]
async fn hello_exposes_sni_and_alpn_without_consuming() {
    let bytes = client_hello_bytes("sniffed.example", &[b"h2", b"http/1.1"]);
    let pool = BufferPool::new(16 * 1024, 2);
    let mut stream = FramedStream::new(bytes.as_slice(), &pool);

    assert!(looks_like_tls(&mut stream).await.unwrap());
    let hello = peek_client_hello(&mut stream).await.unwrap().unwrap();
    assert_eq!(hello.sni.as_deref(), Some("sniffed.example"));
    assert!(hello.offers_alpn("h2"));
    assert!(hello.offers_alpn("http/1.1"));
    assert!(!hello.is_sslv2());
    assert_eq!(hello.max_supported_version, Some(0x0304));
    assert_eq!(stream.available(), bytes.len());
}

#[tokio::test]
async fn plain_http_is_not_tls() {
    let raw: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
    let pool = BufferPool::new(1024, 2);
    let mut stream = FramedStream::new(raw, &pool);
    assert!(!looks_like_tls(&mut stream).await.unwrap());
    assert!(peek_client_hello(&mut stream).await.unwrap().is_none());
}
