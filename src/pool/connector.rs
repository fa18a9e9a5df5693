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
    fmt, io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::{Arc, Weak},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use http::{Method, Version};
use rustls::pki_types::ServerName;
use serde::Deserialize;
use tokio::{
    net::{lookup_host, TcpSocket, TcpStream},
    task,
    time::{sleep, timeout, Instant},
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use crate::{
    http::{codec, names, HeaderCollection, Request},
    io::{BufferPool, FramedStream},
    tls::UpstreamTls,
    utils::{ConnectStage, ProxyError, ProxyResult},
};

use super::{
    connection::{ConnectionTimings, PooledConnection, ServerStream},
    key::ConnectionCacheKey,
};

const DNS_MAX_ATTEMPTS: usize = 3;
const DNS_RETRY_BACKOFF_MS: u64 = 50;

/// An HTTP proxy that upstream connections are tunneled through.
#[derive(Clone, Deserialize)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Connect to loopback origins directly.
    #[serde(default = "default_true")]
    pub bypass_localhost: bool,
}

fn default_true() -> bool {
    true
}

impl fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamProxy")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("bypass_localhost", &self.bypass_localhost)
            .finish()
    }
}

impl UpstreamProxy {
    pub fn identity(&self) -> String {
        match &self.username {
            Some(user) => format!("{user}@{}:{}", self.host, self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// `Proxy-Authorization` value when credentials are configured.
    pub fn basic_credentials(&self) -> Option<String> {
        let user = self.username.as_deref()?;
        let pass = self.password.as_deref().unwrap_or("");
        Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
    }
}

/// Timeouts and limits for establishing upstream connections.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub dns_ttl: Duration,
    /// Local source address for outbound sockets.
    pub bind: Option<SocketAddr>,
    /// The proxy's own listening ports; connecting back to them would loop.
    pub listener_ports: Vec<u16>,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            dns_ttl: Duration::from_secs(60),
            bind: None,
            listener_ports: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct CachedDnsEntry {
    expires_at: Instant,
    addrs: Vec<SocketAddr>,
}

/// Builds fresh upstream connections: DNS, TCP, optional proxy tunnel, optional TLS.
pub struct Connector {
    settings: ConnectorSettings,
    upstream_proxy: Option<UpstreamProxy>,
    tls: Arc<UpstreamTls>,
    buffers: Arc<BufferPool>,
    dns_cache: DashMap<(String, u16), CachedDnsEntry>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("settings", &self.settings)
            .field("upstream_proxy", &self.upstream_proxy)
            .field("dns_cached", &self.dns_cache.len())
            .finish()
    }
}

impl Connector {
    pub fn new(
        settings: ConnectorSettings,
        upstream_proxy: Option<UpstreamProxy>,
        tls: Arc<UpstreamTls>,
        buffers: Arc<BufferPool>,
    ) -> Self {
        Self {
            settings,
            upstream_proxy,
            tls,
            buffers,
            dns_cache: DashMap::new(),
        }
    }

    /// The pool key a request to `host:port` will use through this connector.
    pub fn cache_key(&self, host: &str, port: u16, is_https: bool, alpn: &[String]) -> ConnectionCacheKey {
        ConnectionCacheKey::new(
            host,
            port,
            is_https,
            alpn,
            self.settings.bind,
            self.proxy_for(host).map(UpstreamProxy::identity),
        )
    }

    /// The upstream proxy a request for `host` goes through, honoring the localhost bypass.
    pub fn proxy_for(&self, host: &str) -> Option<&UpstreamProxy> {
        let proxy = self.upstream_proxy.as_ref()?;
        if proxy.bypass_localhost && is_localhost(host) {
            None
        } else {
            Some(proxy)
        }
    }

    /// Establishes a new connection for `key`.
    ///
    /// Through an upstream proxy, HTTPS origins are reached with a CONNECT tunnel while
    /// plain HTTP goes to the proxy itself, which then expects absolute-form requests.
    pub async fn connect(&self, key: &ConnectionCacheKey) -> ProxyResult<PooledConnection> {
        self.establish(key, key.is_https).await
    }

    /// Establishes a connection that carries opaque bytes to `key`'s origin, tunneling
    /// through the upstream proxy when one applies.
    pub async fn connect_tunnel(&self, key: &ConnectionCacheKey) -> ProxyResult<PooledConnection> {
        self.establish(key, true).await
    }

    /// Drops resolver entries whose TTL has passed.
    pub fn prune_dns(&self) -> usize {
        let now = Instant::now();
        let before = self.dns_cache.len();
        self.dns_cache.retain(|_, entry| entry.expires_at > now);
        let pruned = before.saturating_sub(self.dns_cache.len());
        if pruned > 0 {
            tracing::trace!(target: "dns", pruned, "expired dns entries dropped");
        }
        pruned
    }

    /// Runs [`Connector::prune_dns`] every `interval` until `cancel` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> task::JoinHandle<()> {
        let connector: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(connector) = connector.upgrade() else { break };
                        connector.prune_dns();
                    }
                }
            }
        })
    }

    async fn establish(&self, key: &ConnectionCacheKey, tunnel: bool) -> ProxyResult<PooledConnection> {
        let started = Instant::now();
        let mut timings = ConnectionTimings::default();
        let proxy = key.upstream.as_ref().and(self.proxy_for(&key.host));
        let (dial_host, dial_port) = match proxy {
            Some(proxy) => (proxy.host.as_str(), proxy.port),
            None => (key.host.as_str(), key.port),
        };
        tracing::debug!(key = %key, dial_host, dial_port, "dialing upstream");

        let addrs = self.resolve(dial_host, dial_port).await?;
        timings.dns_resolved = Some(started.elapsed());
        self.refuse_loop(dial_host, &addrs)?;

        let (mut tcp, remote_addr) = self.connect_any(dial_host, &addrs).await?;
        timings.tcp_connected = Some(started.elapsed());

        if let Some(proxy) = proxy.filter(|_| tunnel) {
            self.open_tunnel(&mut tcp, proxy, key).await?;
            timings.tunnel_established = Some(started.elapsed());
        }

        let stream = if key.is_https {
            let tls = self.handshake(tcp, key).await?;
            timings.tls_established = Some(started.elapsed());
            ServerStream::Tls(Box::new(tls))
        } else {
            ServerStream::Plain(tcp)
        };

        tracing::debug!(key = %key, %remote_addr, ?timings, "upstream connected");
        Ok(PooledConnection::new(
            key.clone(),
            stream,
            &self.buffers,
            remote_addr,
            timings,
        ))
    }

    fn refuse_loop(&self, host: &str, addrs: &[SocketAddr]) -> ProxyResult<()> {
        for addr in addrs {
            let ip = addr.ip();
            let local = ip.is_loopback()
                || ip.is_unspecified()
                || self.settings.bind.is_some_and(|b| b.ip() == ip);
            if local && self.settings.listener_ports.contains(&addr.port()) {
                return Err(ProxyError::LoopDetected {
                    host: host.to_string(),
                    port: addr.port(),
                });
            }
        }
        Ok(())
    }

    async fn connect_any(
        &self,
        host: &str,
        addrs: &[SocketAddr],
    ) -> ProxyResult<(TcpStream, SocketAddr)> {
        let mut last_err: Option<io::Error> = None;
        for addr in addrs.iter().copied() {
            tracing::trace!(%addr, "attempting upstream TCP connect");
            match timeout(self.settings.connect_timeout, self.dial(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        tracing::trace!(%addr, error = %err, "set_nodelay failed");
                    }
                    return Ok((stream, addr));
                }
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "upstream TCP connect failed");
                    last_err = Some(err);
                }
                Err(_) => {
                    tracing::warn!(%addr, timeout = ?self.settings.connect_timeout, "upstream TCP connect timed out");
                    last_err = Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    ));
                }
            }
        }
        let err = last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to")
        });
        Err(ProxyError::transport(ConnectStage::Tcp, host, err))
    }

    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let Some(bind) = self.settings.bind else {
            return TcpStream::connect(addr).await;
        };
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(SocketAddr::new(bind.ip(), 0))?;
        socket.connect(addr).await
    }

    async fn open_tunnel(
        &self,
        tcp: &mut TcpStream,
        proxy: &UpstreamProxy,
        key: &ConnectionCacheKey,
    ) -> ProxyResult<()> {
        let authority = key.authority();
        let mut headers = HeaderCollection::new();
        headers.add(names::HOST, authority.clone());
        if let Some(credentials) = proxy.basic_credentials() {
            headers.add(names::PROXY_AUTHORIZATION, credentials);
        }
        let mut connect = Request::new(Method::CONNECT, authority, Version::HTTP_11).with_headers(headers);

        let tunnel_err = |e: io::Error| ProxyError::transport(ConnectStage::UpstreamProxy, &proxy.host, e);
        codec::write_request_head(tcp, &mut connect).await.map_err(|e| match e {
            ProxyError::Io(io) => tunnel_err(io),
            other => other,
        })?;

        let mut framed = FramedStream::new(&mut *tcp, &self.buffers);
        let response = codec::read_response(&mut framed).await?.ok_or_else(|| {
            ProxyError::UpstreamProxy(format!("{} closed before answering CONNECT", proxy.host))
        })?;
        if response.status() != 200 {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} answered CONNECT {} with {} {}",
                proxy.host,
                key.authority(),
                response.status(),
                response.reason()
            )));
        }
        if framed.available() > 0 {
            return Err(ProxyError::UpstreamProxy(format!(
                "{} sent data before the tunnel was used",
                proxy.host
            )));
        }
        tracing::debug!(proxy = %proxy.identity(), origin = %key.authority(), "upstream tunnel established");
        Ok(())
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        key: &ConnectionCacheKey,
    ) -> ProxyResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let config = self.tls.client_config(&key.alpn)?;
        let server_name = ServerName::try_from(key.host.clone())
            .map_err(|e| ProxyError::TlsHandshake(format!("invalid server name {}: {e}", key.host)))?;
        let connector = TlsConnector::from(config);
        match timeout(self.settings.handshake_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(err)) => Err(ProxyError::transport(ConnectStage::TlsHandshake, &key.host, err)),
            Err(_) => Err(ProxyError::transport(
                ConnectStage::TlsHandshake,
                &key.host,
                io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"),
            )),
        }
    }

    async fn resolve(&self, host: &str, port: u16) -> ProxyResult<Vec<SocketAddr>> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let cache_key = (host.to_string(), port);
        if let Some(entry) = self.dns_cache.get(&cache_key) {
            if entry.expires_at > Instant::now() && !entry.addrs.is_empty() {
                tracing::trace!(target: "dns", %host, port, "dns cache hit");
                return Ok(entry.addrs.clone());
            }
        }
        self.dns_cache.remove(&cache_key);

        let addrs = resolve_with_backoff(host, port)
            .await
            .map_err(|e| ProxyError::transport(ConnectStage::Dns, host, e))?;
        self.dns_cache.insert(
            cache_key,
            CachedDnsEntry {
                expires_at: Instant::now() + self.settings.dns_ttl,
                addrs: addrs.clone(),
            },
        );
        Ok(addrs)
    }
}

fn is_localhost(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    bare.eq_ignore_ascii_case("localhost")
        || bare.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

async fn resolve_with_backoff(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let mut last_err = None;
    for attempt in 1..=DNS_MAX_ATTEMPTS {
        match lookup_host((host, port)).await {
            Ok(iter) => {
                let addrs: Vec<SocketAddr> = iter.collect();
                if !addrs.is_empty() {
                    return Ok(addrs);
                }
                last_err = Some(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {host}"),
                ));
            }
            Err(err) => {
                tracing::debug!(target: "dns", %host, port, attempt, error = %err, "resolver error");
                last_err = Some(err);
            }
        }
        if attempt < DNS_MAX_ATTEMPTS {
            sleep(Duration::from_millis(DNS_RETRY_BACKOFF_MS * attempt as u64)).await;
        }
    }

    tracing::debug!(target: "dns", %host, port, "async resolver exhausted retries; trying system resolver");
    match resolve_with_system(host, port).await {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs),
        Ok(_) | Err(_) => Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
        })),
    }
}

async fn resolve_with_system(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    let host = host.to_string();
    task::spawn_blocking(move || (host.as_str(), port).to_socket_addrs().map(Iterator::collect))
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::TlsVersion;

    fn connector(listener_ports: Vec<u16>, proxy: Option<UpstreamProxy>) -> Connector {
        let tls = Arc::new(UpstreamTls::new(&[TlsVersion::Tls13, TlsVersion::Tls12], &[]).unwrap());
        Connector::new(
            ConnectorSettings {
                listener_ports,
                ..ConnectorSettings::default()
            },
            proxy,
            tls,
            BufferPool::new(4096, 4),
        )
    }

    #[tokio::test]
    async fn refuses_own_listener() {
        let connector = connector(vec![8080], None);
        let key = connector.cache_key("127.0.0.1", 8080, false, &[]);
        let err = connector.connect(&key).await.unwrap_err();
        assert!(matches!(err, ProxyError::LoopDetected { port: 8080, .. }));
    }

    fn loopback_proxy(port: u16) -> UpstreamProxy {
        UpstreamProxy {
            host: "127.0.0.1".into(),
            port,
            username: Some("alice".into()),
            password: Some("secret".into()),
            bypass_localhost: false,
        }
    }

    async fn read_head(sock: &mut TcpStream) -> String {
        use tokio::io::AsyncReadExt;
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if sock.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn plain_http_goes_to_the_proxy_without_a_tunnel() {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = connector(vec![], Some(loopback_proxy(port)));
        let key = connector.cache_key("example.com", 80, false, &[]);

        let (conn, accepted) = tokio::join!(connector.connect(&key), listener.accept());
        let conn = conn.unwrap();
        let (mut sock, _) = accepted.unwrap();
        assert!(conn.timings().tunnel_established.is_none());

        let mut buf = [0u8; 64];
        let silent = timeout(Duration::from_millis(200), sock.read(&mut buf)).await;
        assert!(silent.is_err(), "nothing may be sent before the request itself");
    }

    #[tokio::test]
    async fn tunnels_are_opened_with_credentials() {
        use tokio::io::AsyncWriteExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = connector(vec![], Some(loopback_proxy(port)));
        let key = connector.cache_key("example.com", 80, false, &[]);

        let proxy = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let head = read_head(&mut sock).await;
            sock.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            head
        });

        let conn = connector.connect_tunnel(&key).await.unwrap();
        assert!(conn.timings().tunnel_established.is_some());
        let head = proxy.await.unwrap();
        assert!(head.starts_with("CONNECT example.com:80 HTTP/1.1\r\n"), "{head}");
        assert!(head.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"), "{head}");
    }

    #[tokio::test]
    async fn expired_dns_entries_are_pruned() {
        let connector = connector(vec![], None);
        let addrs = vec![SocketAddr::from(([192, 0, 2, 1], 80))];
        connector.dns_cache.insert(
            ("stale.test".into(), 80),
            CachedDnsEntry {
                expires_at: Instant::now(),
                addrs: addrs.clone(),
            },
        );
        connector.dns_cache.insert(
            ("fresh.test".into(), 80),
            CachedDnsEntry {
                expires_at: Instant::now() + Duration::from_secs(60),
                addrs,
            },
        );

        assert_eq!(connector.prune_dns(), 1);
        assert!(connector.dns_cache.contains_key(&("fresh.test".to_string(), 80)));
        assert!(!connector.dns_cache.contains_key(&("stale.test".to_string(), 80)));
    }

    #[test]
    fn localhost_bypasses_upstream_proxy() {
        let proxy = UpstreamProxy {
            host: "proxy.internal".into(),
            port: 3128,
            username: Some("alice".into()),
            password: Some("secret".into()),
            bypass_localhost: true,
        };
        assert_eq!(
            proxy.basic_credentials().as_deref(),
            Some("Basic YWxpY2U6c2VjcmV0")
        );
        let connector = connector(vec![], Some(proxy));
        assert!(connector.cache_key("localhost", 80, false, &[]).upstream.is_none());
        assert_eq!(
            connector.cache_key("example.com", 80, false, &[]).upstream.as_deref(),
            Some("alice@proxy.internal:3128")
        );
    }
}
