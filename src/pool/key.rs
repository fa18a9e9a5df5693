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

use std::{fmt, net::SocketAddr};

/// Identity of a reusable upstream connection.
///
/// HTTP version and chunkedness are deliberately absent: an HTTP/1.0 and an HTTP/1.1
/// request to the same origin may share a socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionCacheKey {
    pub host: String,
    pub port: u16,
    pub is_https: bool,
    /// Sorted and de-duplicated, so offer order does not split the pool.
    pub alpn: Vec<String>,
    pub bind: Option<SocketAddr>,
    /// `host:port` of the upstream proxy this connection tunnels through, if any.
    pub upstream: Option<String>,
}

impl ConnectionCacheKey {
    pub fn new(
        host: &str,
        port: u16,
        is_https: bool,
        alpn: &[String],
        bind: Option<SocketAddr>,
        upstream: Option<String>,
    ) -> Self {
        let mut alpn: Vec<String> = alpn.iter().map(|p| p.to_ascii_lowercase()).collect();
        alpn.sort();
        alpn.dedup();
        Self {
            host: host.trim_end_matches('.').to_ascii_lowercase(),
            port,
            is_https,
            alpn,
            bind,
            upstream,
        }
    }

    /// `host:port` as it appears in a CONNECT target or Host header.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ConnectionCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.is_https { "https" } else { "http" };
        write!(f, "{scheme}://{}", self.authority())?;
        if !self.alpn.is_empty() {
            write!(f, " alpn={}", self.alpn.join(","))?;
        }
        if let Some(bind) = self.bind {
            write!(f, " bind={bind}")?;
        }
        if let Some(upstream) = &self.upstream {
            write!(f, " via={upstream}")?;
        }
        Ok(())
    }
}
