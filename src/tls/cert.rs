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
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{Instant, SystemTime},
};

use dashmap::DashMap;
use parking_lot::RwLock;
use rustls::{pki_types::CertificateDer, sign::CertifiedKey};
use tokio::{sync::broadcast, sync::OnceCell, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::CertificatesConfig,
    keystore::{LeafDiskCache, RootStore},
    utils::CertificateError,
};

use super::engine::{engine_for, CertificateEngine, CertificateMaterial, EngineKind};

/// Subject used when a client sends no usable server name.
pub const FALLBACK_SUBJECT: &str = "interpose.local";

/// A failure that happened off the caller's path (root loading, persistence, leaf issuance).
#[derive(Debug, Clone)]
pub struct CertificateFailure {
    pub subject: String,
    pub message: String,
}

#[derive(Debug)]
struct RootAuthority {
    material: CertificateMaterial,
    fingerprint: String,
}

/// One cache entry. `cell` is the single-flight point: the first caller runs generation,
/// everyone else awaits the same cell.
struct LeafSlot {
    cell: OnceCell<Arc<CertifiedKey>>,
    last_access_ms: AtomicU64,
}

impl LeafSlot {
    fn new(now_ms: u64) -> Self {
        Self {
            cell: OnceCell::new(),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }
}

/// Root CA lifecycle plus per-hostname leaf issuance.
///
/// Leaves are cached in memory (and optionally on disk) and evicted after sitting idle for
/// the configured TTL. Every failure is also published on [`CertificateManager::subscribe_failures`]
/// so the accept path never has to handle certificate trouble inline.
pub struct CertificateManager {
    config: CertificatesConfig,
    engine: RwLock<Arc<dyn CertificateEngine>>,
    root: RwLock<Option<Arc<RootAuthority>>>,
    leaves: DashMap<String, Arc<LeafSlot>>,
    root_store: Option<RootStore>,
    disk_cache: Option<LeafDiskCache>,
    stats: CacheStats,
    failures: broadcast::Sender<CertificateFailure>,
    clock: Instant,
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("engine", &self.engine.read().kind())
            .field("has_root", &self.root.read().is_some())
            .field("cached", &self.leaves.len())
            .finish()
    }
}

impl CertificateManager {
    pub fn new(config: CertificatesConfig) -> Result<Arc<Self>, CertificateError> {
        let engine = engine_for(config.engine, config.leaf_key_algorithm)?;
        Ok(Self::with_engine(config, engine))
    }

    /// Builds a manager around an explicit engine.
    pub fn with_engine(config: CertificatesConfig, engine: Arc<dyn CertificateEngine>) -> Arc<Self> {
        let root_store = config
            .root_path
            .clone()
            .map(|path| RootStore::at_path(path, config.root_password.clone()));
        let disk_cache = config.leaf_cache_dir.clone().map(LeafDiskCache::new);
        let (failures, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            engine: RwLock::new(engine),
            root: RwLock::new(None),
            leaves: DashMap::new(),
            root_store,
            disk_cache,
            stats: CacheStats::default(),
            failures,
            clock: Instant::now(),
        })
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<CertificateFailure> {
        self.failures.subscribe()
    }

    fn report(&self, subject: &str, err: &CertificateError) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(subject, error = %err, "certificate operation failed");
        // No subscribers is fine.
        let _ = self.failures.send(CertificateFailure {
            subject: subject.to_string(),
            message: err.to_string(),
        });
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.read().kind()
    }

    /// Switches generation engines. Cached leaves from the previous engine are dropped.
    pub fn set_engine(&self, kind: EngineKind) -> Result<(), CertificateError> {
        if self.engine_kind() == kind {
            return Ok(());
        }
        let engine = engine_for(kind, self.config.leaf_key_algorithm)?;
        self.replace_engine(engine);
        Ok(())
    }

    pub fn replace_engine(&self, engine: Arc<dyn CertificateEngine>) {
        tracing::info!(engine = %engine.kind(), "certificate engine switched");
        *self.engine.write() = engine;
        self.clear_leaves();
    }

    pub fn has_root(&self) -> bool {
        self.root.read().is_some()
    }

    /// PEM of the active root, for installing it into client trust stores.
    pub fn root_certificate_pem(&self) -> Option<String> {
        self.root.read().as_ref().map(|r| r.material.cert_pem.clone())
    }

    pub fn root_certificate_der(&self) -> Option<CertificateDer<'static>> {
        self.root.read().as_ref().map(|r| r.material.cert_der.clone())
    }

    /// Loads the persisted root or creates a new one. Returns whether a usable root exists.
    ///
    /// Failures are reported through the failure channel rather than returned.
    pub async fn ensure_root_certificate(&self, persist: bool) -> bool {
        let now = SystemTime::now();
        if let Some(root) = self.root.read().as_ref() {
            if root.material.is_valid_at(now) {
                return true;
            }
        }

        let subject = self.config.root_subject.clone();
        if let Some(store) = &self.root_store {
            match store.load() {
                Ok(Some(material)) if material.is_valid_at(now) => {
                    tracing::info!(subject = %material.subject, "loaded persisted root certificate");
                    self.install_root(material);
                    return true;
                }
                Ok(Some(material)) => {
                    tracing::warn!(subject = %material.subject, "persisted root certificate expired; replacing");
                }
                Ok(None) => {}
                Err(err) => self.report(&subject, &err),
            }
        }

        let engine = self.engine.read().clone();
        let generated = {
            let subject = subject.clone();
            tokio::task::spawn_blocking(move || engine.make_certificate(&subject, true, None)).await
        };
        let material = match generated {
            Ok(Ok(material)) => material,
            Ok(Err(err)) => {
                self.report(&subject, &err);
                return false;
            }
            Err(join) => {
                self.report(&subject, &CertificateError::generation(&subject, join));
                return false;
            }
        };
        tracing::info!(subject = %subject, "created root certificate");

        if persist {
            match &self.root_store {
                Some(store) => {
                    if let Err(err) = store.save(&material) {
                        self.report(&subject, &err);
                    }
                }
                None => tracing::debug!("no root path configured; root kept in memory only"),
            }
        }
        self.install_root(material);
        true
    }

    fn install_root(&self, material: CertificateMaterial) {
        let fingerprint = material.fingerprint();
        *self.root.write() = Some(Arc::new(RootAuthority {
            material,
            fingerprint,
        }));
        // Leaves signed by a previous root are no longer trustworthy.
        self.leaves.clear();
    }

    /// Drops the root and every cached leaf, in memory and on disk.
    pub fn clear_root_certificate(&self) {
        *self.root.write() = None;
        self.clear_leaves();
    }

    fn clear_leaves(&self) {
        self.leaves.clear();
        if let Some(cache) = &self.disk_cache {
            match cache.clear() {
                Ok(removed) if removed > 0 => tracing::debug!(removed, "cleared leaf disk cache"),
                Ok(_) => {}
                Err(err) => self.report("leaf-cache", &err),
            }
        }
    }

    /// Returns the certificate for `hostname`, generating it at most once at a time.
    pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<CertifiedKey>, CertificateError> {
        let subject = normalize_subject(hostname);
        let Some(root) = self.root.read().clone() else {
            let err = CertificateError::RootUnavailable;
            self.report(&subject, &err);
            return Err(err);
        };

        let now = self.now_ms();
        let slot = self
            .leaves
            .entry(subject.clone())
            .or_insert_with(|| Arc::new(LeafSlot::new(now)))
            .clone();
        slot.last_access_ms.store(now, Ordering::Relaxed);

        if let Some(hit) = slot.cell.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(subject = %subject, "using cached leaf certificate");
            return Ok(Arc::clone(hit));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        let result = slot
            .cell
            .get_or_try_init(|| self.load_or_generate_leaf(&subject, &root))
            .await
            .map(Arc::clone);

        if let Err(err) = &result {
            // Let the next caller retry instead of caching the failure.
            self.leaves
                .remove_if(&subject, |_, current| Arc::ptr_eq(current, &slot));
            self.report(&subject, err);
        }
        result
    }

    async fn load_or_generate_leaf(
        &self,
        subject: &str,
        root: &Arc<RootAuthority>,
    ) -> Result<Arc<CertifiedKey>, CertificateError> {
        let chain = [root.material.cert_der.clone()];

        if let Some(cache) = &self.disk_cache {
            match cache.load(subject, &root.fingerprint) {
                Ok(Some(material)) => {
                    self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(subject, "leaf certificate loaded from disk cache");
                    return Ok(Arc::new(material.certified_key(&chain)?));
                }
                Ok(None) => {}
                Err(err) => tracing::debug!(subject, error = %err, "leaf disk cache unreadable"),
            }
        }

        let engine = self.engine.read().clone();
        let owned_subject = subject.to_string();
        let signer = Arc::clone(root);
        let material = tokio::task::spawn_blocking(move || {
            engine.make_certificate(&owned_subject, false, Some(&signer.material))
        })
        .await
        .map_err(|join| CertificateError::generation(subject, join))??;
        self.stats.generations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subject, "issued new leaf certificate");

        if let Some(cache) = &self.disk_cache {
            if let Err(err) = cache.save(&material, &root.fingerprint) {
                self.report(subject, &err);
            }
        }
        Ok(Arc::new(material.certified_key(&chain)?))
    }

    /// Removes leaves idle for at least the configured TTL. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let ttl = self.config.idle_ttl().as_millis() as u64;
        let now = self.now_ms();
        let before = self.leaves.len();
        self.leaves.retain(|_, slot| {
            let idle = now.saturating_sub(slot.last_access_ms.load(Ordering::Relaxed));
            // An in-flight generation is never evicted from under its waiters.
            idle < ttl || !slot.cell.initialized()
        });
        let evicted = before.saturating_sub(self.leaves.len());
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(evicted, "evicted idle leaf certificates");
        }
        evicted
    }

    /// Runs [`Self::evict_idle`] on the configured interval until cancelled or dropped.
    pub fn spawn_eviction(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.eviction_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.evict_idle();
            }
            tracing::debug!("certificate eviction loop stopped");
        })
    }

    pub fn metrics(&self) -> CertificateMetrics {
        CertificateMetrics {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            generations: self.stats.generations.load(Ordering::Relaxed),
            disk_hits: self.stats.disk_hits.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            cached: self.leaves.len(),
        }
    }
}

/// Lowercases, trims, and drops a trailing dot; empty names map to [`FALLBACK_SUBJECT`].
pub fn normalize_subject(hostname: &str) -> String {
    let trimmed = hostname.trim().trim_end_matches('.');
    let host = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);
    if host.is_empty() {
        FALLBACK_SUBJECT.to_string()
    } else {
        host.to_ascii_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMetrics {
    pub hits: u64,
    pub misses: u64,
    pub generations: u64,
    pub disk_hits: u64,
    pub evictions: u64,
    pub failures: u64,
    pub cached: usize,
}

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    generations: AtomicU64,
    disk_hits: AtomicU64,
    evictions: AtomicU64,
    failures: AtomicU64,
}
