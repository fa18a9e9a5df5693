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

use std::{fmt, sync::Arc, time::Duration};

use rustls::{
    crypto::aws_lc_rs,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

use crate::utils::{ProxyError, ProxyResult};

/// Protocols offered to intercepted clients. Only HTTP/1.x is relayed.
pub const CLIENT_ALPN: &[&[u8]] = &[b"http/1.1"];

/// Presents one issued leaf regardless of the SNI the client sends.
struct IssuedCertificate(Arc<CertifiedKey>);

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("chain_len", &self.0.cert.len())
            .finish()
    }
}

impl ResolvesServerCert for IssuedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Client-facing TLS configuration for one intercepted host.
pub fn server_config(leaf: Arc<CertifiedKey>) -> ProxyResult<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(IssuedCertificate(leaf)));
    config.alpn_protocols = CLIENT_ALPN.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}

/// Runs the server side of the handshake over `io`, bounded by `timeout`.
pub async fn accept<IO>(
    io: IO,
    config: Arc<ServerConfig>,
    timeout: Duration,
) -> ProxyResult<TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = TlsAcceptor::from(config);
    match tokio::time::timeout(timeout, acceptor.accept(io)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(ProxyError::TlsHandshake(err.to_string())),
        Err(_) => Err(ProxyError::TlsHandshake(format!(
            "client handshake timed out after {timeout:?}"
        ))),
    }
}
