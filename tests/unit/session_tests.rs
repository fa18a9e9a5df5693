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
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use interpose::http::{compression::default_provider, HeaderCollection, HttpMessage, Response};
use interpose::io::BufferPool;
use interpose::pool::{ConnectionPool, Connector, ConnectorSettings, PoolSettings, UpstreamProxy};
use interpose::proxy::{
    Flow, FlowStage, ProxyServer, RequestAction, SessionContext, SessionSettings, StagePipeline,
};
use interpose::telemetry::TelemetrySink;
use interpose::tls::{TlsVersion, UpstreamTls};
use interpose::utils::ProxyResult;
use rustls::{crypto::aws_lc_rs, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::support::{manager_with, CountingEngine};

/// A running proxy on a loopback port, stopped when dropped.
struct Harness {
    addr: SocketAddr,
    engine: Arc<CountingEngine>,
    ctx: Arc<SessionContext>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start(stages: Vec<Arc<dyn FlowStage>>, upstream_proxy: Option<UpstreamProxy>) -> Harness {
    let engine = CountingEngine::new();
    let certificates = manager_with(engine.clone()).await;
    let buffers = BufferPool::new(4096, 16);
    let tls = UpstreamTls::new(&[TlsVersion::Tls13, TlsVersion::Tls12], &[]).unwrap();
    let connector = Arc::new(Connector::new(
        ConnectorSettings::default(),
        upstream_proxy,
        Arc::new(tls),
        Arc::clone(&buffers),
    ));
    let ctx = Arc::new(SessionContext {
        settings: SessionSettings {
            client_read_timeout: Some(Duration::from_secs(5)),
            upstream_read_timeout: Some(Duration::from_secs(5)),
            ..SessionSettings::default()
        },
        certificates,
        pool: ConnectionPool::new(PoolSettings::default()),
        connector,
        buffers,
        decompression: default_provider(),
        stages: StagePipeline::new(stages),
        telemetry: TelemetrySink::disabled(),
    });

    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&ctx))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    Harness {
        addr,
        engine,
        ctx,
        cancel,
    }
}

/// Loopback origin running `serve(index, socket)` for every accepted connection.
async fn origin<F, Fut>(serve: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(usize, TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(index, socket));
        }
    });
    (addr, accepted)
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }
    Some(String::from_utf8(head).unwrap())
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse().unwrap())
        .unwrap_or(0)
}

async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let head = read_head(stream).await.expect("response head");
    let mut body = vec![0u8; content_length(&head)];
    stream.read_exact(&mut body).await.unwrap();
    (head, body)
}

/// Consumes the request body and answers with the request target as the body.
async fn reply_with_target(socket: &mut TcpStream, head: &str) -> std::io::Result<()> {
    let mut body = vec![0u8; content_length(head)];
    socket.read_exact(&mut body).await?;
    let target = head.split_whitespace().nth(1).unwrap_or("");
    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{target}",
        target.len()
    );
    socket.write_all(reply.as_bytes()).await
}

async fn answer_targets(mut socket: TcpStream) {
    while let Some(head) = read_head(&mut socket).await {
        if reply_with_target(&mut socket, &head).await.is_err() {
            break;
        }
    }
}

fn get(origin: SocketAddr, path: &str, extra: &str) -> Vec<u8> {
    format!("GET http://{origin}{path} HTTP/1.1\r\nHost: {origin}\r\n{extra}\r\n").into_bytes()
}

#[tokio::test]
async fn keep_alive_clients_share_one_upstream_connection() {
    let (origin_addr, accepted) = origin(|_, socket| answer_targets(socket)).await;
    let proxy = start(Vec::new(), None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    for path in ["/a", "/b"] {
        client.write_all(&get(origin_addr, path, "")).await.unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert_eq!(body, path.as_bytes());
    }

    client
        .write_all(&get(origin_addr, "/c", "Connection: close\r\n"))
        .await
        .unwrap();
    let (_, body) = read_response(&mut client).await;
    assert_eq!(body, b"/c");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.ctx.pool.stats().hits, 2);
}

#[tokio::test]
async fn unreachable_origin_gets_a_bad_gateway() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let proxy = start(Vec::new(), None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&get(closed, "/", "")).await.unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{head}");
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert!(String::from_utf8_lossy(&body).starts_with("upstream request failed"));

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn http10_clients_receive_unchunked_bodies() {
    let (origin_addr, _) = origin(|_, mut socket| async move {
        if read_head(&mut socket).await.is_some() {
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                      5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
                )
                .await;
        }
        answer_targets(socket).await;
    })
    .await;
    let proxy = start(Vec::new(), None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client
        .write_all(format!("GET http://{origin_addr}/ HTTP/1.0\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut raw = Vec::new();
    client.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();

    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(!head.to_ascii_lowercase().contains("transfer-encoding"), "{head}");
    assert_eq!(body, "hello world");
}

#[tokio::test]
async fn informational_responses_are_relayed_before_the_final_one() {
    let (origin_addr, _) = origin(|_, mut socket| async move {
        if read_head(&mut socket).await.is_some() {
            let _ = socket
                .write_all(
                    b"HTTP/1.1 103 Early Hints\r\nLink: </style.css>; rel=preload\r\n\r\n\
                      HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
                )
                .await;
        }
        answer_targets(socket).await;
    })
    .await;
    let proxy = start(Vec::new(), None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client.write_all(&get(origin_addr, "/", "")).await.unwrap();
    let hints = read_head(&mut client).await.unwrap();
    assert!(hints.starts_with("HTTP/1.1 103"), "{hints}");
    assert!(hints.contains("Link: </style.css>; rel=preload\r\n"), "{hints}");
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn dead_pooled_connection_is_replayed_once() {
    let (origin_addr, accepted) = origin(|index, mut socket| async move {
        if index == 0 {
            // Serve one request, then hang up on the next without answering.
            if let Some(head) = read_head(&mut socket).await {
                let _ = reply_with_target(&mut socket, &head).await;
            }
            let _ = read_head(&mut socket).await;
            return;
        }
        answer_targets(socket).await;
    })
    .await;
    let proxy = start(Vec::new(), None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    for path in ["/one", "/two"] {
        client.write_all(&get(origin_addr, path, "")).await.unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert_eq!(body, path.as_bytes());
    }

    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    let stats = proxy.ctx.pool.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

/// Answers every request that arrives inside an intercepted tunnel.
struct AnswerInsideTunnels;

#[async_trait]
impl FlowStage for AnswerInsideTunnels {
    async fn on_request(&self, flow: &mut Flow) -> ProxyResult<RequestAction> {
        if !flow.metadata.target.is_https {
            return Ok(RequestAction::Forward);
        }
        let mut response = Response::with_status(200);
        response
            .headers_mut()?
            .set("X-Intercepted", flow.metadata.target.host.clone());
        response.set_body(Bytes::from_static(b"inside"))?;
        Ok(RequestAction::Respond(response))
    }
}

#[tokio::test]
async fn connect_tunnels_are_intercepted_with_the_cached_leaf() {
    let stage: Arc<dyn FlowStage> = Arc::new(AnswerInsideTunnels);
    let proxy = start(vec![stage], None).await;
    proxy.ctx.certificates.issue_leaf("intercept.test").await.unwrap();
    assert_eq!(proxy.engine.leaves.load(Ordering::SeqCst), 1);

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(b"CONNECT intercept.test:443 HTTP/1.1\r\nHost: intercept.test:443\r\n\r\n")
        .await
        .unwrap();
    let established = read_head(&mut client).await.unwrap();
    assert!(established.starts_with("HTTP/1.1 200"), "{established}");

    let mut roots = RootCertStore::empty();
    roots
        .add(proxy.ctx.certificates.root_certificate_der().unwrap())
        .unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = ServerName::try_from("intercept.test").unwrap();
    let mut tls = TlsConnector::from(Arc::new(config))
        .connect(name, client)
        .await
        .unwrap();

    tls.write_all(b"GET /inner HTTP/1.1\r\nHost: intercept.test\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert!(head.contains("X-Intercepted: intercept.test\r\n"), "{head}");
    assert_eq!(body, b"inside");
    assert_eq!(proxy.engine.leaves.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_tls_tunnels_are_relayed_blind() {
    let (echo_addr, _) = origin(|_, mut socket| async move {
        let mut buf = [0u8; 64];
        while let Ok(n) = socket.read(&mut buf).await {
            if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    })
    .await;
    let proxy = start(Vec::new(), None).await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let established = read_head(&mut client).await.unwrap();
    assert!(established.starts_with("HTTP/1.1 200"), "{established}");

    client.write_all(b"ping\n").await.unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping\n");
    assert_eq!(proxy.engine.leaves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn plain_requests_reach_the_upstream_proxy_in_absolute_form() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let upstream = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let head = read_head(&mut socket).await.unwrap();
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        head
    });
    let proxy = start(
        Vec::new(),
        Some(UpstreamProxy {
            host: "127.0.0.1".into(),
            port,
            username: Some("alice".into()),
            password: Some("secret".into()),
            bypass_localhost: false,
        }),
    )
    .await;
    let mut client = TcpStream::connect(proxy.addr).await.unwrap();

    client
        .write_all(
            b"GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\
              Proxy-Authorization: Basic Y2xpZW50OmNyZWRz\r\n\r\n",
        )
        .await
        .unwrap();
    let (head, body) = read_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"ok");

    let seen = upstream.await.unwrap();
    assert!(seen.starts_with("GET http://example.com/x HTTP/1.1\r\n"), "{seen}");
    assert!(seen.contains("Proxy-Authorization: Basic YWxpY2U6c2VjcmV0\r\n"), "{seen}");
    assert!(!seen.contains("Y2xpZW50OmNyZWRz"), "{seen}");
}

/// Records multipart part headers, optionally buffering the request body first.
#[derive(Default)]
struct PartRecorder {
    buffer: bool,
    parts: Mutex<Vec<(usize, String)>>,
}

#[async_trait]
impl FlowStage for PartRecorder {
    async fn on_request(&self, _flow: &mut Flow) -> ProxyResult<RequestAction> {
        Ok(if self.buffer {
            RequestAction::Buffer
        } else {
            RequestAction::Forward
        })
    }

    fn wants_multipart_parts(&self, _flow: &Flow) -> bool {
        true
    }

    fn on_multipart_part(&self, _flow_id: Uuid, index: usize, headers: &HeaderCollection) {
        let disposition = headers.get_first("Content-Disposition").unwrap_or("");
        self.parts.lock().unwrap().push((index, disposition.to_string()));
    }
}

const FORM: &[u8] = b"--XyZ\r\n\
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
async fn multipart_part_headers_reach_opted_in_stages() {
    let (origin_addr, _) = origin(|_, socket| answer_targets(socket)).await;
    for buffer in [false, true] {
        let recorder = Arc::new(PartRecorder {
            buffer,
            ..PartRecorder::default()
        });
        let stage: Arc<dyn FlowStage> = recorder.clone();
        let proxy = start(vec![stage], None).await;
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();

        let head = format!(
            "POST http://{origin_addr}/upload HTTP/1.1\r\nHost: {origin_addr}\r\n\
             Content-Type: multipart/form-data; boundary=XyZ\r\n\
             Content-Length: {}\r\n\r\n",
            FORM.len()
        );
        client.write_all(head.as_bytes()).await.unwrap();
        client.write_all(FORM).await.unwrap();
        let (head, body) = read_response(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 200"), "{head}");
        assert_eq!(body, b"/upload");

        let parts = recorder.parts.lock().unwrap().clone();
        assert_eq!(
            parts,
            vec![
                (0, "form-data; name=\"a\"".to_string()),
                (1, "form-data; name=\"b\"; filename=\"f.txt\"".to_string()),
            ],
            "buffered: {buffer}"
        );
    }
}
