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

use std::fmt;

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Where an outbound connection attempt was when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    Dns,
    Tcp,
    UpstreamProxy,
    TlsHandshake,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectStage::Dns => "dns",
            ConnectStage::Tcp => "tcp",
            ConnectStage::UpstreamProxy => "upstream-proxy",
            ConnectStage::TlsHandshake => "tls-handshake",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{stage} failed for {host}: {source}")]
    Transport {
        stage: ConnectStage,
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("refusing to connect to own listener {host}:{port}")]
    LoopDetected { host: String, port: u16 },

    #[error("upstream proxy rejected tunnel: {0}")]
    UpstreamProxy(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// True for failures that mean the socket underneath is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProxyError::Transport { .. } | ProxyError::Io(_) | ProxyError::TlsHandshake(_)
        )
    }

    pub fn transport(stage: ConnectStage, host: impl Into<String>, source: std::io::Error) -> Self {
        ProxyError::Transport {
            stage,
            host: host.into(),
            source,
        }
    }
}

/// Malformed wire data. These always fail the current message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("header line without colon: {0:?}")]
    MalformedHeader(String),

    #[error("unsupported HTTP version: {0:?}")]
    UnsupportedVersion(String),

    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),

    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    #[error("unexpected trailing data after declared body")]
    UnexpectedTrailingData,

    #[error("stream ended before the declared body was complete")]
    UnexpectedEof,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("peek window {requested} exceeds buffer capacity {capacity}")]
    PeekOutOfRange { requested: usize, capacity: usize },

    #[error("unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("message is locked")]
    MessageLocked,

    #[error("stream is closed")]
    StreamClosed,
}

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("root certificate is not available")]
    RootUnavailable,

    #[error("certificate generation failed for {subject}: {reason}")]
    Generation { subject: String, reason: String },

    #[error("certificate engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("certificate storage error: {0}")]
    Storage(String),

    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl CertificateError {
    pub fn generation(subject: &str, reason: impl fmt::Display) -> Self {
        CertificateError::Generation {
            subject: subject.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rcgen::Error> for CertificateError {
    fn from(err: rcgen::Error) -> Self {
        CertificateError::InvalidMaterial(err.to_string())
    }
}
