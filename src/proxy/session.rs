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

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use http::{Method, Uri, Version};
use tokio::{io::copy_bidirectional, net::TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    http::{
        codec::{read_request, read_response, write_request_head, write_response_head},
        copy_body, names, read_body, syphon_body, write_body, BodyFraming, ByteObserver,
        DecompressionProvider, FramingMode, HttpMessage, Request, Response,
    },
    io::{BoxedIo, BufferPool, ClientStream, FramedStream},
    pool::{ConnectionPool, Connector, PooledConnection},
    telemetry::TelemetrySink,
    tls::{acceptor, peek_client_hello, sniff::looks_like_tls, CertificateManager},
    utils::{ConnectStage, ProtocolError, ProxyError, ProxyResult},
};

use super::flow::{
    text_response, BodyPolicy, Direction, Flow, FlowTarget, RequestAction, StagePipeline,
};

/// Protocols spoken toward origins for intercepted HTTPS.
const UPSTREAM_ALPN: &[&str] = &["http/1.1"];

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Intercept TLS inside CONNECT tunnels; otherwise tunnels are relayed blind.
    pub decrypt_https: bool,
    pub handshake_timeout: Duration,
    pub client_read_timeout: Option<Duration>,
    pub upstream_read_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            decrypt_https: true,
            handshake_timeout: Duration::from_secs(10),
            client_read_timeout: Some(Duration::from_secs(120)),
            upstream_read_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Everything a session needs, shared by all sessions of one server.
pub struct SessionContext {
    pub settings: SessionSettings,
    pub certificates: Arc<CertificateManager>,
    pub pool: Arc<ConnectionPool>,
    pub connector: Arc<Connector>,
    pub buffers: Arc<BufferPool>,
    pub decompression: Arc<dyn DecompressionProvider>,
    pub stages: StagePipeline,
    pub telemetry: TelemetrySink,
}

/// Serves one accepted client connection until either side is done.
pub async fn handle_client(
    socket: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
) -> ProxyResult<()> {
    if let Err(err) = socket.set_nodelay(true) {
        tracing::trace!(%peer, error = %err, "set_nodelay failed");
    }
    let session = Session { ctx, peer, cancel };
    let client = session.frame(Box::new(socket));
    match session.serve(client, None, None).await? {
        ServeOutcome::Closed => Ok(()),
        ServeOutcome::Connect { client, host, port } => session.tunnel(client, host, port).await,
    }
}

enum ServeOutcome {
    Closed,
    /// The client asked for a tunnel; the 200 has already been sent.
    Connect {
        client: ClientStream,
        host: String,
        port: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepAlive {
    Continue,
    Close,
}

impl KeepAlive {
    fn from_close(close: bool) -> Self {
        if close {
            KeepAlive::Close
        } else {
            KeepAlive::Continue
        }
    }
}

struct UpstreamReply {
    response: Response,
    /// The request body never went upstream (a final status arrived instead of `100`).
    body_unsent: bool,
}

struct Session {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl Session {
    fn frame(&self, io: BoxedIo) -> ClientStream {
        FramedStream::new(io, &self.ctx.buffers)
            .with_cancellation(self.cancel.clone())
            .with_read_timeout(self.ctx.settings.client_read_timeout)
    }

    async fn serve(
        &self,
        mut client: ClientStream,
        origin: Option<FlowTarget>,
        sni: Option<String>,
    ) -> ProxyResult<ServeOutcome> {
        loop {
            let Some(request) = read_request(&mut client).await? else {
                return Ok(ServeOutcome::Closed);
            };

            if request.is_connect() {
                if origin.is_some() {
                    let mut refusal = text_response(405, "CONNECT inside a tunnel is not supported\n")?;
                    send_local(&mut client, &mut refusal).await?;
                    return Ok(ServeOutcome::Closed);
                }
                let (host, port) = parse_authority(request.target(), 443)?;
                let mut established = Response::new(request.version(), 200, "Connection Established");
                write_response_head(&mut client, &mut established).await?;
                tracing::debug!(peer = %self.peer, %host, port, "tunnel requested");
                return Ok(ServeOutcome::Connect { client, host, port });
            }

            if self.exchange(&mut client, request, origin.as_ref(), sni.as_deref()).await?
                == KeepAlive::Close
            {
                return Ok(ServeOutcome::Closed);
            }
        }
    }

    /// Decides between interception and a blind relay for a CONNECT tunnel.
    async fn tunnel(&self, mut client: ClientStream, host: String, port: u16) -> ProxyResult<()> {
        if !looks_like_tls(&mut client).await? {
            if client.is_closed() && client.available() == 0 {
                return Ok(());
            }
            return self.relay(client, &host, port).await;
        }

        let hello = peek_client_hello(&mut client).await?;
        let sni = hello.as_ref().and_then(|h| h.sni.clone());
        if !self.ctx.settings.decrypt_https || hello.as_ref().is_some_and(|h| h.is_sslv2()) {
            return self.relay(client, &host, port).await;
        }

        let subject = sni.clone().unwrap_or_else(|| host.clone());
        let leaf = match self.ctx.certificates.issue_leaf(&subject).await {
            Ok(leaf) => leaf,
            Err(err) => {
                tracing::warn!(peer = %self.peer, %subject, error = %err, "no certificate; relaying tunnel undecrypted");
                return self.relay(client, &host, port).await;
            }
        };

        let config = acceptor::server_config(leaf)?;
        let tls = acceptor::accept(client, config, self.ctx.settings.handshake_timeout).await?;
        tracing::debug!(peer = %self.peer, %host, port, sni = ?sni, "client TLS established");

        let client = self.frame(Box::new(tls));
        let origin = FlowTarget {
            host,
            port,
            is_https: true,
        };
        self.serve(client, Some(origin), sni).await?;
        Ok(())
    }

    async fn relay(&self, mut client: ClientStream, host: &str, port: u16) -> ProxyResult<()> {
        let key = self.ctx.connector.cache_key(host, port, false, &[]);
        let mut upstream = self.ctx.connector.connect_tunnel(&key).await?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProxyError::Cancelled),
            copied = copy_bidirectional(&mut client, upstream.stream()) => {
                let (up, down) = copied?;
                tracing::debug!(peer = %self.peer, host, port, up, down, "blind relay finished");
                Ok(())
            }
        }
    }

    /// One request/response exchange.
    async fn exchange(
        &self,
        client: &mut ClientStream,
        mut request: Request,
        origin: Option<&FlowTarget>,
        sni: Option<&str>,
    ) -> ProxyResult<KeepAlive> {
        let client_close = request.wants_close();
        let request_framing = request.body_framing()?;

        let Some(target) = self.resolve_target(&mut request, origin)? else {
            let mut refusal = text_response(400, "request target must be in absolute form\n")?;
            send_local(client, &mut refusal).await?;
            return Ok(KeepAlive::Close);
        };
        strip_proxy_headers(&mut request)?;
        if !target.is_https {
            if let Some(credentials) = self
                .ctx
                .connector
                .proxy_for(&target.host)
                .and_then(|p| p.basic_credentials())
            {
                request.headers_mut()?.set(names::PROXY_AUTHORIZATION, credentials);
            }
        }

        let mut flow = Flow::new(self.peer, request, target);
        flow.metadata.sni = sni.map(str::to_string);

        let buffered = match self.ctx.stages.process_request(&mut flow).await? {
            RequestAction::Respond(mut response) => {
                let expects_continue = flow.request.expects_continue();
                if !expects_continue {
                    flow.metadata.request_body_bytes =
                        syphon_body(client, &request_framing).await?;
                }
                flow.metadata.answered_locally = true;
                let close = client_close || expects_continue || response.wants_close();
                send_local(client, &mut response).await?;
                flow.response = Some(response);
                self.ctx.telemetry.flow_completed(&flow);
                return Ok(KeepAlive::from_close(close));
            }
            RequestAction::Buffer => {
                self.buffer_request(client, &mut flow, &request_framing).await?;
                true
            }
            RequestAction::Forward => false,
        };

        let (mut conn, reply) = match self
            .send_request(client, &mut flow, &request_framing, buffered)
            .await
        {
            Ok(sent) => sent,
            Err(err)
                if err.is_transport()
                    || matches!(
                        err,
                        ProxyError::LoopDetected { .. } | ProxyError::UpstreamProxy(_)
                    ) =>
            {
                tracing::warn!(peer = %self.peer, host = %flow.metadata.target.host, error = %err, "upstream failed");
                let mut failure = text_response(502, &format!("upstream request failed: {err}\n"))?;
                send_local(client, &mut failure).await?;
                flow.response = Some(failure);
                self.ctx.telemetry.flow_completed(&flow);
                return Ok(KeepAlive::Close);
            }
            Err(err) => return Err(err),
        };

        match self.deliver_response(client, &mut conn, &mut flow, reply).await {
            Ok(Some((upstream_close, client_side_close))) => {
                self.ctx.pool.release(conn, upstream_close);
                self.ctx.telemetry.flow_completed(&flow);
                Ok(KeepAlive::from_close(client_close || client_side_close))
            }
            Ok(None) => {
                // Protocol switched; the relay already ran to completion.
                self.ctx.telemetry.flow_completed(&flow);
                Ok(KeepAlive::Close)
            }
            Err(err) => {
                self.ctx.pool.release(conn, true);
                Err(err)
            }
        }
    }

    /// Where a request goes. Absolute-form targets are rewritten to origin-form unless a
    /// plain request is headed for an upstream proxy.
    fn resolve_target(
        &self,
        request: &mut Request,
        origin: Option<&FlowTarget>,
    ) -> ProxyResult<Option<FlowTarget>> {
        let is_absolute = request.target().contains("://");
        if let Some(origin) = origin {
            if is_absolute {
                let uri = parse_uri(request.target())?;
                request.set_target(origin_form(&uri))?;
            }
            return Ok(Some(origin.clone()));
        }
        if !is_absolute {
            return Ok(None);
        }

        let uri = parse_uri(request.target())?;
        let is_https = uri.scheme_str().is_some_and(|s| s.eq_ignore_ascii_case("https"));
        let Some(host) = uri.host() else {
            return Ok(None);
        };
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });
        if is_https || self.ctx.connector.proxy_for(&host).is_none() {
            request.set_target(origin_form(&uri))?;
        }
        if !request.headers().contains(names::HOST) {
            let authority = uri
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| host.clone());
            request.headers_mut()?.set(names::HOST, authority);
        }
        Ok(Some(FlowTarget {
            host,
            port,
            is_https,
        }))
    }

    async fn buffer_request(
        &self,
        client: &mut ClientStream,
        flow: &mut Flow,
        framing: &BodyFraming,
    ) -> ProxyResult<()> {
        if flow.request.expects_continue() {
            let mut proceed = Response::new(flow.request.version(), 100, "Continue");
            write_response_head(client, &mut proceed).await?;
            flow.request.headers_mut()?.remove(names::EXPECT);
        }
        let body = read_body(
            client,
            framing,
            FramingMode::RemoveChunked,
            self.ctx.decompression.as_ref(),
        )
        .await?;
        flow.metadata.request_body_bytes = body.len() as u64;
        if let Some(mut scanner) = self.ctx.stages.multipart_scanner(flow) {
            let stages = &self.ctx.stages;
            let flow_id = flow.id;
            scanner.feed(&body, &mut |index, headers| {
                stages.multipart_part(flow_id, index, headers)
            });
        }
        if framing.is_empty() {
            flow.request.store_body(body)?;
        } else {
            flow.request.set_body(body)?;
        }
        self.ctx.stages.process_request_body(flow).await
    }

    /// Acquires a connection and sends the request; a reused socket that turns out to be
    /// dead is discarded and the request replayed once on a fresh one, when replay is safe.
    async fn send_request(
        &self,
        client: &mut ClientStream,
        flow: &mut Flow,
        request_framing: &BodyFraming,
        buffered: bool,
    ) -> ProxyResult<(PooledConnection, UpstreamReply)> {
        let target = flow.metadata.target.clone();
        let alpn: Vec<String> = if target.is_https {
            UPSTREAM_ALPN.iter().map(|p| p.to_string()).collect()
        } else {
            Vec::new()
        };
        let key = self
            .ctx
            .connector
            .cache_key(&target.host, target.port, target.is_https, &alpn);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let connector = &self.ctx.connector;
            let key = &key;
            let mut conn = self
                .ctx
                .pool
                .acquire(key, move || connector.connect(key))
                .await?;
            let replayable =
                attempt == 1 && conn.is_reused() && (buffered || request_framing.is_empty());
            conn.stream()
                .set_read_timeout(self.ctx.settings.upstream_read_timeout);
            flow.metadata.upstream_reused = conn.is_reused();
            flow.metadata.upstream_addr = Some(conn.remote_addr());
            flow.metadata.upstream_timings = Some(*conn.timings());

            match self
                .send_once(client, &mut conn, flow, request_framing, buffered)
                .await
            {
                Ok(Some(reply)) => return Ok((conn, reply)),
                Ok(None) if replayable => {
                    tracing::debug!(id = conn.id(), "pooled connection closed before responding; retrying");
                    self.ctx.pool.release(conn, true);
                }
                Ok(None) => {
                    self.ctx.pool.release(conn, true);
                    return Err(ProxyError::transport(
                        ConnectStage::Tcp,
                        target.host,
                        io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed without a response"),
                    ));
                }
                Err(err) if replayable && err.is_transport() => {
                    tracing::debug!(id = conn.id(), error = %err, "pooled connection failed; retrying");
                    self.ctx.pool.release(conn, true);
                }
                Err(err) => {
                    self.ctx.pool.release(conn, true);
                    return Err(err);
                }
            }
        }
    }

    async fn send_once(
        &self,
        client: &mut ClientStream,
        conn: &mut PooledConnection,
        flow: &mut Flow,
        request_framing: &BodyFraming,
        buffered: bool,
    ) -> ProxyResult<Option<UpstreamReply>> {
        let upstream = conn.stream();
        write_request_head(upstream, &mut flow.request).await?;

        if buffered {
            if let Some(body) = flow.request.body().filter(|b| !b.is_empty()) {
                write_body(upstream, body, false).await?;
            }
        } else if !request_framing.is_empty() {
            if flow.request.expects_continue() {
                let Some(mut interim) = read_response(upstream).await? else {
                    return Ok(None);
                };
                if interim.status() != 100 {
                    return Ok(Some(UpstreamReply {
                        response: interim,
                        body_unsent: true,
                    }));
                }
                write_response_head(client, &mut interim).await?;
            }
            let stages = &self.ctx.stages;
            let flow_id = flow.id;
            let mut parts = stages.multipart_scanner(flow);
            let mut observe = move |bytes: &[u8]| {
                stages.observe(flow_id, Direction::Request, bytes);
                if let Some(scanner) = parts.as_mut() {
                    scanner.feed(bytes, &mut |index, headers| {
                        stages.multipart_part(flow_id, index, headers)
                    });
                }
            };
            let observer: ByteObserver<'_> = &mut observe;
            flow.metadata.request_body_bytes = copy_body(
                client,
                upstream,
                FramingMode::None,
                request_framing,
                self.ctx.decompression.as_ref(),
                Some(observer),
            )
            .await?;
        }

        loop {
            let Some(mut response) = read_response(upstream).await? else {
                return Ok(None);
            };
            if response.is_informational() && response.status() != 101 {
                write_response_head(client, &mut response).await?;
                continue;
            }
            return Ok(Some(UpstreamReply {
                response,
                body_unsent: false,
            }));
        }
    }

    /// Sends the response on to the client. Returns `(close upstream, close client)`, or
    /// `None` when the exchange became a protocol switch and both sides are finished.
    async fn deliver_response(
        &self,
        client: &mut ClientStream,
        conn: &mut PooledConnection,
        flow: &mut Flow,
        reply: UpstreamReply,
    ) -> ProxyResult<Option<(bool, bool)>> {
        let UpstreamReply {
            mut response,
            body_unsent,
        } = reply;
        let method: Method = flow.request.method().clone();

        if response
            .headers()
            .get_all(names::WWW_AUTHENTICATE)
            .any(is_connection_bound_auth)
        {
            conn.taint_auth();
        }

        if response.status() == 101 {
            write_response_head(client, &mut response).await?;
            flow.response = Some(response);
            conn.taint_auth();
            let copied = copy_bidirectional(client, conn.stream()).await;
            if let Ok((up, down)) = copied {
                tracing::debug!(peer = %self.peer, up, down, "upgraded connection finished");
            }
            return Ok(None);
        }

        let framing = response.body_framing(&method)?;
        let close_delimited = response.is_close_delimited(&method)?;
        let upstream_close = response.wants_close() || close_delimited || body_unsent;
        let mut client_close = upstream_close;

        flow.response = Some(response);
        let policy = self.ctx.stages.process_response_headers(flow).await?;
        let upstream = conn.stream();
        let Some(response) = flow.response.as_mut() else {
            return Err(ProtocolError::StreamClosed.into());
        };

        if policy == BodyPolicy::Buffer {
            let decodable = framing
                .content_encoding
                .as_deref()
                .is_some_and(|enc| self.ctx.decompression.decoder(enc).is_some());
            let body = read_body(
                upstream,
                &framing,
                FramingMode::Uncompress,
                self.ctx.decompression.as_ref(),
            )
            .await?;
            flow.metadata.response_body_bytes = body.len() as u64;
            if decodable {
                response.headers_mut()?.remove(names::CONTENT_ENCODING);
            }
            if framing.is_empty() {
                response.store_body(body)?;
            } else {
                response.set_body(body)?;
                // The client gets a length now, so the connection can outlive the body.
                client_close = response.wants_close();
            }
            self.ctx.stages.process_response_body(flow).await?;

            let Some(response) = flow.response.as_mut() else {
                return Err(ProtocolError::StreamClosed.into());
            };
            write_response_head(client, response).await?;
            if let Some(body) = response.body().filter(|b| !b.is_empty()) {
                write_body(client, body, false).await?;
            }
            return Ok(Some((upstream_close, client_close)));
        }

        let mut mode = FramingMode::None;
        if flow.request.version() == Version::HTTP_10 && framing.is_chunked {
            response.set_chunked(false)?;
            mode = FramingMode::RemoveChunked;
            client_close = true;
        }
        write_response_head(client, response).await?;

        let stages = &self.ctx.stages;
        let flow_id = flow.id;
        let mut observe = move |bytes: &[u8]| stages.observe(flow_id, Direction::Response, bytes);
        let observer: ByteObserver<'_> = &mut observe;
        flow.metadata.response_body_bytes = copy_body(
            upstream,
            client,
            mode,
            &framing,
            self.ctx.decompression.as_ref(),
            Some(observer),
        )
        .await?;
        Ok(Some((upstream_close, client_close)))
    }
}

async fn send_local(client: &mut ClientStream, response: &mut Response) -> ProxyResult<()> {
    write_response_head(client, response).await?;
    if let Some(body) = response.body().filter(|b| !b.is_empty()) {
        write_body(client, body, false).await?;
    }
    Ok(())
}

/// Proxy-scoped headers never travel past the proxy.
fn strip_proxy_headers(request: &mut Request) -> ProxyResult<()> {
    let headers = request.headers_mut()?;
    headers.remove(names::PROXY_CONNECTION);
    headers.remove(names::PROXY_AUTHORIZATION);
    Ok(())
}

fn is_connection_bound_auth(value: &str) -> bool {
    let scheme = value.split_whitespace().next().unwrap_or("");
    scheme.eq_ignore_ascii_case("ntlm") || scheme.eq_ignore_ascii_case("negotiate")
}

fn parse_uri(target: &str) -> ProxyResult<Uri> {
    target
        .parse::<Uri>()
        .map_err(|_| ProtocolError::MalformedRequestLine(target.to_string()).into())
}

fn origin_form(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .to_string()
}

/// Splits a CONNECT authority (`host:port`, `[v6]:port`, or bare host).
pub fn parse_authority(authority: &str, default_port: u16) -> ProxyResult<(String, u16)> {
    let malformed = || ProxyError::from(ProtocolError::MalformedRequestLine(authority.to_string()));
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(malformed)?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| malformed())?,
            None if tail.is_empty() => default_port,
            None => return Err(malformed()),
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse().map_err(|_| malformed())?;
            if host.is_empty() {
                return Err(malformed());
            }
            Ok((host.to_string(), port))
        }
        Some(_) => Err(malformed()),
        None if authority.is_empty() => Err(malformed()),
        None => Ok((authority.to_string(), default_port)),
    }
}
