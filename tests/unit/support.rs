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

//! Fixtures shared by the integration tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use interpose::config::CertificatesConfig;
use interpose::tls::engine::RcgenEngine;
use interpose::tls::{
    CertificateEngine, CertificateManager, CertificateMaterial, EngineKind, LeafKeyAlgorithm,
};
use interpose::utils::CertificateError;

/// Delegates to the portable engine and counts leaf generations.
pub struct CountingEngine {
    inner: RcgenEngine,
    pub leaves: AtomicUsize,
}

impl CountingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RcgenEngine::new(LeafKeyAlgorithm::Ecdsa),
            leaves: AtomicUsize::new(0),
        })
    }
}

impl CertificateEngine for CountingEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Portable
    }

    fn make_certificate(
        &self,
        subject: &str,
        is_root: bool,
        signer: Option<&CertificateMaterial>,
    ) -> Result<CertificateMaterial, CertificateError> {
        if !is_root {
            self.leaves.fetch_add(1, Ordering::SeqCst);
            // Widen the window in which concurrent callers could race.
            std::thread::sleep(Duration::from_millis(50));
        }
        self.inner.make_certificate(subject, is_root, signer)
    }
}

pub async fn manager_with(engine: Arc<CountingEngine>) -> Arc<CertificateManager> {
    let manager = CertificateManager::with_engine(CertificatesConfig::in_memory(), engine);
    assert!(manager.ensure_root_certificate(false).await);
    manager
}
