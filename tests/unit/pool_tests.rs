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
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use interpose::io::BufferPool;
use interpose::pool::{
    ConnectionCacheKey, ConnectionPool, ConnectionTimings, PoolSettings, PooledConnection,
    ServerStream,
};
use tokio::net::{TcpListener, TcpStream};

/// Loopback origin that accepts connections and holds them open.
async fn origin() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

async fn dial(
    key: &ConnectionCacheKey,
    addr: std::net::SocketAddr,
    buffers: &Arc<BufferPool>,
    dials: &AtomicUsize,
) -> interpose::utils::ProxyResult<PooledConnection> {
    dials.fetch_add(1, Ordering::SeqCst);
    let tcp = TcpStream::connect(addr).await?;
    Ok(PooledConnection::new(
        key.clone(),
        ServerStream::Plain(tcp),
        buffers,
        addr,
        ConnectionTimings::default(),
    ))
}

fn key_for(port: u16) -> ConnectionCacheKey {
    ConnectionCacheKey::new("127.0.0.1", port, false, &[], None, None)
}

#[tokio::test]
async fn released_connection_is_reused_within_idle_timeout() {
    let addr = origin().await;
    let pool = ConnectionPool::new(PoolSettings::default());
    let buffers = BufferPool::new(4096, 4);
    let dials = AtomicUsize::new(0);
    let key = key_for(addr.port());

    let first = pool
        .acquire(&key, || dial(&key, addr, &buffers, &dials))
        .await
        .unwrap();
    let first_id = first.id();
    assert!(!first.is_reused());
    pool.release(first, false);
    assert_eq!(pool.idle_count(), 1);

    let second = pool
        .acquire(&key, || dial(&key, addr, &buffers, &dials))
        .await
        .unwrap();
    assert_eq!(second.id(), first_id);
    assert!(second.is_reused());
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    let stats = pool.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn expired_connections_move_to_disposal() {
    let addr = origin().await;
    let pool = ConnectionPool::new(PoolSettings {
        idle_timeout: Duration::from_millis(80),
        safety_margin: Duration::from_millis(20),
        close_linger: Duration::ZERO,
        ..PoolSettings::default()
    });
    let buffers = BufferPool::new(4096, 4);
    let dials = AtomicUsize::new(0);
    let key = key_for(addr.port());

    let conn = pool
        .acquire(&key, || dial(&key, addr, &buffers, &dials))
        .await
        .unwrap();
    pool.release(conn, false);
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.pending_disposal(), 1);
    pool.dispose_pending().unwrap().await.unwrap();
    assert_eq!(pool.pending_disposal(), 0);

    let fresh = pool
        .acquire(&key, || dial(&key, addr, &buffers, &dials))
        .await
        .unwrap();
    assert!(!fresh.is_reused());
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn auth_bound_connections_are_never_pooled() {
    let addr = origin().await;
    let pool = ConnectionPool::new(PoolSettings::default());
    let buffers = BufferPool::new(4096, 4);
    let dials = AtomicUsize::new(0);
    let key = key_for(addr.port());

    let mut conn = pool
        .acquire(&key, || dial(&key, addr, &buffers, &dials))
        .await
        .unwrap();
    conn.taint_auth();
    pool.release(conn, false);

    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.pending_disposal(), 1);
}

#[tokio::test]
async fn equivalent_keys_share_idle_connections() {
    let addr = origin().await;
    let pool = ConnectionPool::new(PoolSettings::default());
    let buffers = BufferPool::new(4096, 4);
    let dials = AtomicUsize::new(0);
    let offered = ["http/1.1".to_string(), "h2".to_string()];
    let reordered = ["h2".to_string(), "http/1.1".to_string()];
    let spelled =
        ConnectionCacheKey::new("Origin.Test.", addr.port(), false, &offered, None, None);
    let canonical =
        ConnectionCacheKey::new("origin.test", addr.port(), false, &reordered, None, None);

    let conn = pool
        .acquire(&spelled, || dial(&spelled, addr, &buffers, &dials))
        .await
        .unwrap();
    pool.release(conn, false);

    let reused = pool
        .acquire(&canonical, || dial(&canonical, addr, &buffers, &dials))
        .await
        .unwrap();
    assert!(reused.is_reused());
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    let other = ConnectionCacheKey::new(
        "origin.test",
        addr.port(),
        false,
        &offered,
        None,
        Some("proxy.internal:3128".into()),
    );
    let separate = pool
        .acquire(&other, || dial(&other, addr, &buffers, &dials))
        .await
        .unwrap();
    assert!(!separate.is_reused());
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn releases_racing_sweeps_keep_every_connection() {
    let addr = origin().await;
    let pool = ConnectionPool::new(PoolSettings::default());
    let buffers = BufferPool::new(4096, 4);
    let dials = AtomicUsize::new(0);

    let mut conns = Vec::new();
    for i in 0..64 {
        let host = format!("h{i}.test");
        let key = ConnectionCacheKey::new(&host, addr.port(), false, &[], None, None);
        conns.push(dial(&key, addr, &buffers, &dials).await.unwrap());
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let sweeper = {
        let pool = Arc::clone(&pool);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::SeqCst) {
                pool.sweep();
            }
        })
    };
    let releases: Vec<_> = conns
        .into_iter()
        .map(|conn| {
            let pool = Arc::clone(&pool);
            tokio::task::spawn_blocking(move || pool.release(conn, false))
        })
        .collect();
    for release in releases {
        release.await.unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    sweeper.await.unwrap();

    assert_eq!(pool.idle_count() + pool.pending_disposal(), 64);
    assert_eq!(pool.idle_count(), 64);
}
