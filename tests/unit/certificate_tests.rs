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
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use futures::future::join_all;
use interpose::config::CertificatesConfig;
use interpose::tls::{acceptor, CertificateManager};
use rustls::{crypto::aws_lc_rs, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use crate::support::{manager_with, CountingEngine};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_generation() {
    let engine = CountingEngine::new();
    let manager = manager_with(engine.clone()).await;

    let results = join_all((0..8).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.issue_leaf("shared.example").await })
    }))
    .await;
    let leaves: Vec<_> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(engine.leaves.load(Ordering::SeqCst), 1);
    assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &leaves[0])));
}

#[tokio::test]
async fn cached_leaf_is_reused_across_spellings() {
    let engine = CountingEngine::new();
    let manager = manager_with(engine.clone()).await;

    let first = manager.issue_leaf("Cache.Example").await.unwrap();
    let second = manager.issue_leaf("cache.example.").await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.leaves.load(Ordering::SeqCst), 1);
    let metrics = manager.metrics();
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.generations, 1);
}

#[tokio::test]
async fn issued_leaf_completes_a_handshake_trusted_by_the_root() {
    let manager = manager_with(CountingEngine::new()).await;
    let leaf = manager.issue_leaf("intercept.example").await.unwrap();
    let server_config = acceptor::server_config(leaf).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(manager.root_certificate_der().unwrap()).unwrap();
    let client_config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(async move {
        let mut tls = acceptor::accept(server_io, server_config, Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        tls.write_all(b"pong").await.unwrap();
        tls.flush().await.unwrap();
        buf
    });

    let connector = TlsConnector::from(Arc::new(client_config));
    let name = ServerName::try_from("intercept.example").unwrap();
    let mut client = connector.connect(name, client_io).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    client.flush().await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();

    assert_eq!(&reply, b"pong");
    assert_eq!(&server.await.unwrap(), b"ping");
}

#[tokio::test]
async fn leaves_wait_for_a_root() {
    let manager =
        CertificateManager::with_engine(CertificatesConfig::in_memory(), CountingEngine::new());
    let mut failures = manager.subscribe_failures();

    assert!(manager.issue_leaf("early.example").await.is_err());
    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.subject, "early.example");
}
