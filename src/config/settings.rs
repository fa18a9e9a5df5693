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
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
    pool::{ConnectorSettings, PoolSettings, UpstreamProxy},
    telemetry::TelemetryMode,
    tls::{EngineKind, LeafKeyAlgorithm, TlsVersion},
};

/// Top-level configuration parsed from the Interpose TOML file.
///
/// Every section has defaults, so an empty file is a valid loopback proxy with an
/// in-memory root. Relative paths are resolved beside the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InterposeConfig {
    pub listener: ListenerConfig,
    pub certificates: CertificatesConfig,
    pub pool: PoolConfig,
    pub upstream: UpstreamConfig,
    pub buffers: BufferConfig,
    pub timeouts: TimeoutConfig,
    pub decryption: DecryptionConfig,
    pub telemetry: TelemetryConfig,
}

impl InterposeConfig {
    /// Reads the config file, deserializes TOML, and normalizes relative paths.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg = Self::parse(&raw)
            .with_context(|| format!("invalid config: {}", path.display()))?;

        let base_dir = path.parent();
        if let Some(root) = cfg.certificates.root_path.as_mut() {
            absolutize(base_dir, root);
        }
        if let Some(dir) = cfg.certificates.leaf_cache_dir.as_mut() {
            absolutize(base_dir, dir);
        }
        Ok(cfg)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

fn absolutize(base_dir: Option<&Path>, target: &mut PathBuf) {
    if target.is_relative() {
        if let Some(dir) = base_dir {
            *target = dir.join(&*target);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: IpAddr,
    pub bind_port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            bind_port: 8080,
        }
    }
}

impl ListenerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.bind_port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CertificatesConfig {
    pub engine: EngineKind,
    pub leaf_key_algorithm: LeafKeyAlgorithm,
    /// Common name of the generated root.
    pub root_subject: String,
    /// Encrypted root container. `None` keeps the root in memory only.
    pub root_path: Option<PathBuf>,
    pub root_password: String,
    /// Persist a freshly generated root to `root_path`.
    pub persist_root: bool,
    /// Issued leaves survive restarts here when set.
    pub leaf_cache_dir: Option<PathBuf>,
    pub idle_ttl_secs: u64,
    pub eviction_interval_secs: u64,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            leaf_key_algorithm: LeafKeyAlgorithm::default(),
            root_subject: "Interpose Root CA".into(),
            root_path: None,
            root_password: String::new(),
            persist_root: true,
            leaf_cache_dir: None,
            idle_ttl_secs: 60 * 60,
            eviction_interval_secs: 60,
        }
    }
}

impl CertificatesConfig {
    /// No disk state at all: for tests and throwaway runs.
    pub fn in_memory() -> Self {
        Self {
            persist_root: false,
            ..Self::default()
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub enabled: bool,
    pub idle_timeout_secs: u64,
    pub safety_margin_ms: u64,
    pub max_idle_per_key: usize,
    pub maintenance_interval_ms: u64,
    pub close_linger_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = PoolSettings::default();
        Self {
            enabled: defaults.enabled,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            safety_margin_ms: defaults.safety_margin.as_millis() as u64,
            max_idle_per_key: defaults.max_idle_per_key,
            maintenance_interval_ms: defaults.maintenance_interval.as_millis() as u64,
            close_linger_ms: defaults.close_linger.as_millis() as u64,
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            enabled: self.enabled,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            safety_margin: Duration::from_millis(self.safety_margin_ms),
            max_idle_per_key: self.max_idle_per_key.max(1),
            maintenance_interval: Duration::from_millis(self.maintenance_interval_ms.max(100)),
            close_linger: Duration::from_millis(self.close_linger_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Route origin traffic through this HTTP proxy.
    pub proxy: Option<UpstreamProxy>,
    /// Local address outbound sockets bind to.
    pub bind_address: Option<IpAddr>,
    pub tls_versions: Vec<TlsVersion>,
    /// Accept any upstream certificate. Never enable outside test rigs.
    pub insecure_skip_verify: bool,
    /// Extra PEM trust anchors for upstream validation (private CAs).
    pub extra_roots: Vec<PathBuf>,
    pub dns_ttl_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            bind_address: None,
            tls_versions: vec![TlsVersion::Tls13, TlsVersion::Tls12],
            insecure_skip_verify: false,
            extra_roots: Vec::new(),
            dns_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub size: usize,
    pub max_retained: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: crate::io::DEFAULT_BUFFER_SIZE,
            max_retained: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_secs: u64,
    pub handshake_secs: u64,
    /// `0` disables the idle read deadline on that side.
    pub client_read_secs: u64,
    pub upstream_read_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            handshake_secs: 10,
            client_read_secs: 120,
            upstream_read_secs: 120,
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl TimeoutConfig {
    pub fn client_read(&self) -> Option<Duration> {
        optional_secs(self.client_read_secs)
    }

    pub fn upstream_read(&self) -> Option<Duration> {
        optional_secs(self.upstream_read_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs.max(1))
    }
}

impl UpstreamConfig {
    pub fn connector_settings(&self, timeouts: &TimeoutConfig, listener: &ListenerConfig) -> ConnectorSettings {
        ConnectorSettings {
            connect_timeout: Duration::from_secs(timeouts.connect_secs.max(1)),
            handshake_timeout: timeouts.handshake(),
            dns_ttl: Duration::from_secs(self.dns_ttl_secs),
            bind: self.bind_address.map(|ip| SocketAddr::new(ip, 0)),
            listener_ports: vec![listener.bind_port],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecryptionConfig {
    /// Intercept HTTPS inside CONNECT tunnels. When off every tunnel is a blind relay.
    pub enabled: bool,
}

impl Default for DecryptionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
}
