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

//! On-disk certificate storage: the password-protected root container and the leaf cache.

mod container;

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{tls::engine::CertificateMaterial, utils::CertificateError};

pub use container::{open_container, seal_container};

/// Byte-oriented secret storage addressed by name.
pub trait KeyStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, CertificateError>;
    fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), CertificateError>;
    fn delete_secret(&self, key: &str) -> Result<(), CertificateError>;
}

/// One file holding one secret; the key name is ignored.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for FileKeyStore {
    fn get_secret(&self, _key: &str) -> Result<Option<Vec<u8>>, CertificateError> {
        if self.path.exists() {
            Ok(Some(fs::read(&self.path)?))
        } else {
            Ok(None)
        }
    }

    fn set_secret(&self, _key: &str, value: &[u8]) -> Result<(), CertificateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, value)?;
        Ok(())
    }

    fn delete_secret(&self, _key: &str) -> Result<(), CertificateError> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// A directory with one file per key; names go through [`file_name_for`].
#[derive(Debug, Clone)]
pub struct DirectoryKeyStore {
    dir: PathBuf,
    extension: &'static str,
}

impl DirectoryKeyStore {
    pub fn new(dir: impl Into<PathBuf>, extension: &'static str) -> Self {
        Self {
            dir: dir.into(),
            extension,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_name_for(key), self.extension))
    }

    /// Removes every entry with this store's extension. Returns how many files went away.
    pub fn clear(&self) -> Result<usize, CertificateError> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(self.extension) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

impl KeyStore for DirectoryKeyStore {
    fn get_secret(&self, key: &str) -> Result<Option<Vec<u8>>, CertificateError> {
        let path = self.path_for(key);
        if path.exists() {
            Ok(Some(fs::read(path)?))
        } else {
            Ok(None)
        }
    }

    fn set_secret(&self, key: &str, value: &[u8]) -> Result<(), CertificateError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> Result<(), CertificateError> {
        let path = self.path_for(key);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Filesystem-safe name for a certificate subject. `*` becomes `$x$` so wildcard and plain
/// names never collide; anything outside `[A-Za-z0-9._-]` becomes `_`.
pub fn file_name_for(subject: &str) -> String {
    let mut out = String::with_capacity(subject.len());
    for c in subject.chars() {
        match c {
            '*' => out.push_str("$x$"),
            c if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') => out.push(c),
            _ => out.push('_'),
        }
    }
    out
}

const ROOT_SECRET: &str = "root";

/// Root CA persisted inside an encrypted container.
pub struct RootStore {
    store: Box<dyn KeyStore>,
    password: String,
}

impl RootStore {
    pub fn new(store: Box<dyn KeyStore>, password: impl Into<String>) -> Self {
        Self {
            store,
            password: password.into(),
        }
    }

    pub fn at_path(path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self::new(Box::new(FileKeyStore::new(path)), password)
    }

    pub fn load(&self) -> Result<Option<CertificateMaterial>, CertificateError> {
        let Some(sealed) = self.store.get_secret(ROOT_SECRET)? else {
            return Ok(None);
        };
        let stored: StoredCertificate = serde_json::from_slice(&open_container(&sealed, &self.password)?)
            .map_err(|e| CertificateError::Storage(format!("root container payload: {e}")))?;
        CertificateMaterial::from_pem(stored.subject, stored.cert_pem, stored.key_pem).map(Some)
    }

    pub fn save(&self, root: &CertificateMaterial) -> Result<(), CertificateError> {
        let payload = serde_json::to_vec(&StoredCertificate::from_material(root, None))
            .map_err(|e| CertificateError::Storage(e.to_string()))?;
        let sealed = seal_container(&payload, &self.password)?;
        self.store.set_secret(ROOT_SECRET, &sealed)
    }

    pub fn delete(&self) -> Result<(), CertificateError> {
        self.store.delete_secret(ROOT_SECRET)
    }
}

/// Issued leaves kept on disk across restarts, bound to the root that signed them.
pub struct LeafDiskCache {
    store: DirectoryKeyStore,
}

impl LeafDiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            store: DirectoryKeyStore::new(dir, "json"),
        }
    }

    /// Returns the cached leaf if it was signed by `issuer_fingerprint` and is still valid.
    pub fn load(
        &self,
        subject: &str,
        issuer_fingerprint: &str,
    ) -> Result<Option<CertificateMaterial>, CertificateError> {
        let Some(raw) = self.store.get_secret(subject)? else {
            return Ok(None);
        };
        let stored: StoredCertificate = match serde_json::from_slice(&raw) {
            Ok(stored) => stored,
            Err(err) => {
                tracing::debug!(subject, error = %err, "discarding unreadable cached leaf");
                self.store.delete_secret(subject)?;
                return Ok(None);
            }
        };
        if stored.subject != subject || stored.issuer.as_deref() != Some(issuer_fingerprint) {
            return Ok(None);
        }
        let material = CertificateMaterial::from_pem(stored.subject, stored.cert_pem, stored.key_pem)?;
        if !material.is_valid_at(std::time::SystemTime::now()) {
            self.store.delete_secret(subject)?;
            return Ok(None);
        }
        Ok(Some(material))
    }

    pub fn save(
        &self,
        leaf: &CertificateMaterial,
        issuer_fingerprint: &str,
    ) -> Result<(), CertificateError> {
        let payload =
            serde_json::to_vec_pretty(&StoredCertificate::from_material(leaf, Some(issuer_fingerprint)))
                .map_err(|e| CertificateError::Storage(e.to_string()))?;
        self.store.set_secret(&leaf.subject, &payload)
    }

    pub fn clear(&self) -> Result<usize, CertificateError> {
        self.store.clear()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCertificate {
    subject: String,
    cert_pem: String,
    key_pem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    issuer: Option<String>,
}

impl StoredCertificate {
    fn from_material(material: &CertificateMaterial, issuer: Option<&str>) -> Self {
        Self {
            subject: material.subject.clone(),
            cert_pem: material.cert_pem.clone(),
            key_pem: material.key_pem.clone(),
            issuer: issuer.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::engine::{CertificateEngine, LeafKeyAlgorithm, RcgenEngine};
    use tempfile::tempdir;

    #[test]
    fn subject_file_names_are_filesystem_safe() {
        assert_eq!(file_name_for("*.example.com"), "$x$.example.com");
        assert_eq!(file_name_for("a:b/c"), "a_b_c");
    }

    #[test]
    fn root_round_trips_through_container() {
        let dir = tempdir().expect("tempdir");
        let engine = RcgenEngine::new(LeafKeyAlgorithm::Ecdsa);
        let root = engine.make_certificate("Test Root", true, None).unwrap();

        let store = RootStore::at_path(dir.path().join("root.bin"), "hunter2");
        store.save(&root).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.cert_der, root.cert_der);

        let wrong = RootStore::at_path(dir.path().join("root.bin"), "nope");
        assert!(wrong.load().is_err());
    }

    #[test]
    fn cached_leaf_is_bound_to_its_issuer() {
        let dir = tempdir().expect("tempdir");
        let engine = RcgenEngine::new(LeafKeyAlgorithm::Ecdsa);
        let root = engine.make_certificate("Test Root", true, None).unwrap();
        let leaf = engine
            .make_certificate("*.example.com", false, Some(&root))
            .unwrap();

        let cache = LeafDiskCache::new(dir.path());
        cache.save(&leaf, &root.fingerprint()).unwrap();
        assert!(cache
            .load("*.example.com", &root.fingerprint())
            .unwrap()
            .is_some());
        assert!(cache.load("*.example.com", "other").unwrap().is_none());
        assert_eq!(cache.clear().unwrap(), 1);
    }
}
