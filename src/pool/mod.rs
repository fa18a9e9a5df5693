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

//! Reusable upstream connections keyed by [`ConnectionCacheKey`].
//!
//! Idle connections sit in per-key FIFO queues (oldest first). Anything that cannot be
//! reused goes to a disposal set that the maintenance loop drains off the request path.

pub mod connection;
pub mod connector;
pub mod key;

use std::{
    collections::VecDeque,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::utils::ProxyResult;

pub use connection::{ConnectionTimings, PooledConnection, ServerStream};
pub use connector::{Connector, ConnectorSettings, UpstreamProxy};
pub use key::ConnectionCacheKey;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub enabled: bool,
    /// How long an idle connection stays reusable.
    pub idle_timeout: Duration,
    /// Subtracted from `idle_timeout` on acquire so we never race the server's own timeout.
    pub safety_margin: Duration,
    pub max_idle_per_key: usize,
    pub maintenance_interval: Duration,
    /// Pause before closing disposed sockets so the peer closes first.
    pub close_linger: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(60),
            safety_margin: Duration::from_secs(1),
            max_idle_per_key: 16,
            maintenance_interval: Duration::from_secs(3),
            close_linger: Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    created: AtomicU64,
    released: AtomicU64,
    disposed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub created: u64,
    pub released: u64,
    pub disposed: u64,
    pub idle: usize,
    pub pending_disposal: usize,
}

type IdleQueue = Arc<Mutex<VecDeque<PooledConnection>>>;

pub struct ConnectionPool {
    settings: PoolSettings,
    idle: DashMap<ConnectionCacheKey, IdleQueue>,
    /// Serializes key insertion and whole-map sweeps.
    structure: Mutex<()>,
    disposal: Mutex<Vec<PooledConnection>>,
    counters: PoolCounters,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            idle: DashMap::new(),
            structure: Mutex::new(()),
            disposal: Mutex::new(Vec::new()),
            counters: PoolCounters::default(),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn max_idle(&self) -> Duration {
        self.settings
            .idle_timeout
            .saturating_sub(self.settings.safety_margin)
    }

    /// Hands out an idle connection for `key`, or one built by `factory`.
    ///
    /// Stale or dead candidates met on the way are moved to the disposal set.
    pub async fn acquire<F, Fut>(
        &self,
        key: &ConnectionCacheKey,
        factory: F,
    ) -> ProxyResult<PooledConnection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<PooledConnection>>,
    {
        if self.settings.enabled {
            if let Some(mut conn) = self.take_idle(key) {
                conn.checkout();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(id = conn.id(), %key, "reusing pooled connection");
                return Ok(conn);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let mut conn = factory().await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        conn.checkout();
        Ok(conn)
    }

    fn take_idle(&self, key: &ConnectionCacheKey) -> Option<PooledConnection> {
        let queue = self.idle.get(key).map(|q| Arc::clone(q.value()))?;
        let now = Instant::now();
        let max_idle = self.max_idle();
        let mut rejected = Vec::new();
        let found = {
            let mut queue = queue.lock();
            // Newest first: the most recently used socket is the most likely to be alive.
            let mut found = None;
            while let Some(conn) = queue.pop_back() {
                if conn.is_fresh(now, max_idle) && conn.probe_alive() {
                    found = Some(conn);
                    break;
                }
                rejected.push(conn);
            }
            found
        };
        if !rejected.is_empty() {
            tracing::trace!(%key, count = rejected.len(), "idle connections failed reuse checks");
            self.disposal.lock().extend(rejected);
        }
        found
    }

    /// Returns a connection after use. `force_close` sends it straight to disposal.
    pub fn release(&self, mut conn: PooledConnection, force_close: bool) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        let reusable = self.settings.enabled
            && !force_close
            && !conn.is_auth_tainted()
            && !conn.is_closed()
            && conn.stream().available() == 0;
        if !reusable {
            tracing::trace!(
                id = conn.id(),
                force_close,
                auth_tainted = conn.is_auth_tainted(),
                "connection not reusable"
            );
            self.disposal.lock().push(conn);
            return;
        }

        conn.touch();
        let overflow = {
            // Held until the push lands; a sweep in between would drop the queue.
            let _guard = self.structure.lock();
            let queue = self.queue_for(conn.key());
            let mut queue = queue.lock();
            queue.push_back(conn);
            let excess = queue.len().saturating_sub(self.settings.max_idle_per_key);
            queue.drain(..excess).collect::<Vec<_>>()
        };
        if !overflow.is_empty() {
            self.disposal.lock().extend(overflow);
        }
    }

    /// Callers hold `structure`.
    fn queue_for(&self, key: &ConnectionCacheKey) -> IdleQueue {
        Arc::clone(
            self.idle
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
                .value(),
        )
    }

    /// Moves expired idle connections to disposal and drops empty queues.
    /// Returns how many connections were moved.
    pub fn sweep(&self) -> usize {
        let _guard = self.structure.lock();
        let now = Instant::now();
        let max_idle = self.max_idle();
        let mut stale = Vec::new();
        self.idle.retain(|_, queue| {
            let mut queue = queue.lock();
            while queue
                .front()
                .is_some_and(|conn| !conn.is_fresh(now, max_idle))
            {
                if let Some(conn) = queue.pop_front() {
                    stale.push(conn);
                }
            }
            !queue.is_empty()
        });
        let moved = stale.len();
        if moved > 0 {
            self.disposal.lock().extend(stale);
        }
        moved
    }

    /// Connections waiting to be closed.
    pub fn pending_disposal(&self) -> usize {
        self.disposal.lock().len()
    }

    /// Closes everything in the disposal set on a background task.
    pub fn dispose_pending(&self) -> Option<JoinHandle<()>> {
        let doomed = std::mem::take(&mut *self.disposal.lock());
        if doomed.is_empty() {
            return None;
        }
        self.counters
            .disposed
            .fetch_add(doomed.len() as u64, Ordering::Relaxed);
        let linger = self.settings.close_linger;
        Some(tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            for conn in doomed {
                conn.shutdown().await;
            }
        }))
    }

    /// Moves every idle connection to disposal and closes them.
    pub fn clear(&self) -> Option<JoinHandle<()>> {
        {
            let _guard = self.structure.lock();
            let mut disposal = self.disposal.lock();
            for entry in self.idle.iter() {
                disposal.extend(entry.value().lock().drain(..));
            }
            self.idle.clear();
        }
        self.dispose_pending()
    }

    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.maintenance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let moved = pool.sweep();
                        if moved > 0 {
                            tracing::debug!(moved, "expired idle upstream connections");
                        }
                        pool.dispose_pending();
                    }
                }
            }
            if let Some(pool) = pool.upgrade() {
                pool.clear();
            }
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|q| q.value().lock().len()).sum()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            created: self.counters.created.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            disposed: self.counters.disposed.load(Ordering::Relaxed),
            idle: self.idle_count(),
            pending_disposal: self.pending_disposal(),
        }
    }
}
