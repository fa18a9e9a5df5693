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

use std::{fs, sync::Arc};

use anyhow::{Context, Result};
use rustls::pki_types::{pem::PemObject, CertificateDer};
use tokio_util::sync::CancellationToken;

use crate::{
    config::InterposeConfig,
    http::compression::default_provider,
    io::BufferPool,
    pool::{ConnectionPool, Connector},
    proxy::{ProxyServer, SessionContext, SessionSettings, StagePipeline},
    telemetry::TelemetrySink,
    tls::{AcceptAnyCertificate, CertificateManager, UpstreamTls},
};

/// InterposeApp wires configuration into the shared services and the proxy server.
///
/// Initialization order:
/// 1. Certificate manager, then the root (loaded or generated) when decryption is on
/// 2. Upstream TLS configuration and the connector
/// 3. Connection pool and buffer pool
/// 4. The server, once [`InterposeApp::run`] binds the listener
pub struct InterposeApp {
    config: InterposeConfig,
    certificates: Arc<CertificateManager>,
    pool: Arc<ConnectionPool>,
    connector: Arc<Connector>,
    buffers: Arc<BufferPool>,
    stages: StagePipeline,
    telemetry: TelemetrySink,
}

impl InterposeApp {
    pub async fn new(config: InterposeConfig) -> Result<Self> {
        let certificates = CertificateManager::new(config.certificates.clone())
            .context("failed to set up certificate engine")?;
        if config.decryption.enabled
            && !certificates
                .ensure_root_certificate(config.certificates.persist_root)
                .await
        {
            tracing::warn!("root certificate unavailable; HTTPS tunnels will be relayed undecrypted");
        }

        let extra_roots = load_extra_roots(&config)?;
        let mut upstream_tls = UpstreamTls::new(&config.upstream.tls_versions, &extra_roots)?;
        if config.upstream.insecure_skip_verify {
            tracing::warn!("upstream certificate validation is disabled");
            upstream_tls = upstream_tls.with_validator(Arc::new(AcceptAnyCertificate));
        }

        let buffers = BufferPool::new(config.buffers.size, config.buffers.max_retained);
        let connector = Arc::new(Connector::new(
            config
                .upstream
                .connector_settings(&config.timeouts, &config.listener),
            config.upstream.proxy.clone(),
            Arc::new(upstream_tls),
            Arc::clone(&buffers),
        ));
        let pool = ConnectionPool::new(config.pool.settings());
        let telemetry = TelemetrySink::new(config.telemetry.mode);

        Ok(Self {
            config,
            certificates,
            pool,
            connector,
            buffers,
            stages: StagePipeline::default(),
            telemetry,
        })
    }

    /// Installs the flow hooks every session runs.
    pub fn with_stages(mut self, stages: StagePipeline) -> Self {
        self.stages = stages;
        self
    }

    pub fn certificates(&self) -> &Arc<CertificateManager> {
        &self.certificates
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Binds the listener and serves until `cancel` fires, then stops background work.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let background = cancel.child_token();
        let eviction = self.certificates.spawn_eviction(background.clone());
        let maintenance = self.pool.spawn_maintenance(background.clone());
        let dns = self
            .connector
            .spawn_maintenance(self.pool.settings().maintenance_interval, background.clone());
        let failures = spawn_failure_log(&self.certificates, background.clone());

        let ctx = Arc::new(SessionContext {
            settings: SessionSettings {
                decrypt_https: self.config.decryption.enabled,
                handshake_timeout: self.config.timeouts.handshake(),
                client_read_timeout: self.config.timeouts.client_read(),
                upstream_read_timeout: self.config.timeouts.upstream_read(),
            },
            certificates: Arc::clone(&self.certificates),
            pool: Arc::clone(&self.pool),
            connector: Arc::clone(&self.connector),
            buffers: Arc::clone(&self.buffers),
            decompression: default_provider(),
            stages: self.stages.clone(),
            telemetry: self.telemetry.clone(),
        });
        let server = ProxyServer::bind(self.config.listener.socket_addr(), ctx).await?;
        let result = server.run(cancel).await;

        background.cancel();
        for task in [eviction, maintenance, dns, failures] {
            if let Err(err) = task.await {
                tracing::debug!(error = %err, "background task ended abnormally");
            }
        }
        tracing::info!(stats = ?self.pool.stats(), certificates = ?self.certificates.metrics(), "shutdown complete");
        result
    }
}

fn spawn_failure_log(
    certificates: &Arc<CertificateManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut failures = certificates.subscribe_failures();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = failures.recv() => match received {
                    Ok(failure) => {
                        tracing::warn!(subject = %failure.subject, error = %failure.message, "certificate failure");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "certificate failure log lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

fn load_extra_roots(config: &InterposeConfig) -> Result<Vec<CertificateDer<'static>>> {
    let mut roots = Vec::new();
    for path in &config.upstream.extra_roots {
        let pem = fs::read(path)
            .with_context(|| format!("failed to read trust anchor {}", path.display()))?;
        for cert in CertificateDer::pem_slice_iter(&pem) {
            roots.push(cert.with_context(|| format!("invalid PEM in {}", path.display()))?);
        }
    }
    Ok(roots)
}
