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
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256,
};
use rustls::{
    crypto::aws_lc_rs::sign::any_supported_type,
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
};
use serde::{Deserialize, Serialize};

use crate::utils::CertificateError;

/// Certificates are valid from this long before issuance so skewed client clocks accept them.
pub const VALIDITY_GRACE: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const ROOT_VALIDITY: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);
pub const LEAF_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

const ORGANIZATION: &str = "Interpose";

/// Which engine signs certificates. Selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Pure-Rust generation (rcgen), available everywhere.
    #[default]
    Portable,
    /// The host's `openssl` tool.
    Native,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Portable => f.write_str("portable"),
            EngineKind::Native => f.write_str("native"),
        }
    }
}

/// Key type for generated leaves. Roots always prefer RSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafKeyAlgorithm {
    #[default]
    Ecdsa,
    Rsa,
}

/// A certificate with its PKCS#8 private key.
#[derive(Clone)]
pub struct CertificateMaterial {
    pub subject: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("subject", &self.subject)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CertificateMaterial {
    /// Rebuilds material from PEM text, reading the validity window out of the certificate.
    pub fn from_pem(
        subject: impl Into<String>,
        cert_pem: String,
        key_pem: String,
    ) -> Result<Self, CertificateError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| CertificateError::InvalidMaterial(format!("certificate PEM: {e}")))?;
        PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
            .map_err(|e| CertificateError::InvalidMaterial(format!("private key PEM: {e}")))?;
        let (not_before, not_after) = validity_of(&cert_der)?;
        Ok(Self {
            subject: subject.into(),
            cert_pem,
            key_pem,
            cert_der,
            not_before,
            not_after,
        })
    }

    pub fn is_valid_at(&self, at: SystemTime) -> bool {
        self.not_before <= at && at < self.not_after
    }

    /// SHA-256 of the DER certificate, lowercase hex.
    pub fn fingerprint(&self) -> String {
        let digest = ring::digest::digest(&ring::digest::SHA256, self.cert_der.as_ref());
        digest.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Builds the rustls signing identity: this certificate followed by `chain`.
    pub fn certified_key(
        &self,
        chain: &[CertificateDer<'static>],
    ) -> Result<CertifiedKey, CertificateError> {
        let key = PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
            .map_err(|e| CertificateError::InvalidMaterial(format!("private key PEM: {e}")))?;
        let signing_key = any_supported_type(&key)?;
        let mut certs = Vec::with_capacity(chain.len() + 1);
        certs.push(self.cert_der.clone());
        certs.extend(chain.iter().cloned());
        Ok(CertifiedKey::new(certs, signing_key))
    }
}

/// Reads `notBefore`/`notAfter` from a DER certificate.
pub fn validity_of(der: &CertificateDer<'_>) -> Result<(SystemTime, SystemTime), CertificateError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| CertificateError::InvalidMaterial(format!("x509: {e}")))?;
    let validity = cert.validity();
    Ok((
        system_time(validity.not_before.timestamp()),
        system_time(validity.not_after.timestamp()),
    ))
}

fn system_time(unix_secs: i64) -> SystemTime {
    if unix_secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(unix_secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs(unix_secs.unsigned_abs())
    }
}

/// Produces a certificate for `subject`: a self-signed CA when `is_root`, otherwise a
/// server leaf signed by `signer`.
///
/// Engines are synchronous; callers run them on the blocking pool.
pub trait CertificateEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn make_certificate(
        &self,
        subject: &str,
        is_root: bool,
        signer: Option<&CertificateMaterial>,
    ) -> Result<CertificateMaterial, CertificateError>;
}

/// Instantiates the engine selected by configuration.
pub fn engine_for(
    kind: EngineKind,
    leaf_keys: LeafKeyAlgorithm,
) -> Result<Arc<dyn CertificateEngine>, CertificateError> {
    match kind {
        EngineKind::Portable => Ok(Arc::new(RcgenEngine::new(leaf_keys))),
        EngineKind::Native => Ok(Arc::new(OpensslEngine::detect(leaf_keys)?)),
    }
}

#[derive(Debug, Clone)]
pub struct RcgenEngine {
    leaf_keys: LeafKeyAlgorithm,
}

impl RcgenEngine {
    pub fn new(leaf_keys: LeafKeyAlgorithm) -> Self {
        Self { leaf_keys }
    }

    fn root(&self, subject: &str) -> Result<CertificateMaterial, CertificateError> {
        let key = KeyPair::generate_for(&PKCS_RSA_SHA256)?;
        let now = SystemTime::now();
        let not_before = now - VALIDITY_GRACE;
        let not_after = now + ROOT_VALIDITY;

        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.distinguished_name = distinguished_name(subject);
        params.not_before = not_before.into();
        params.not_after = not_after.into();

        let cert = params.self_signed(&key)?;
        Ok(CertificateMaterial {
            subject: subject.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            not_before,
            not_after,
        })
    }

    fn leaf(
        &self,
        subject: &str,
        signer: &CertificateMaterial,
    ) -> Result<CertificateMaterial, CertificateError> {
        let key = match self.leaf_keys {
            LeafKeyAlgorithm::Ecdsa => KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?,
            LeafKeyAlgorithm::Rsa => KeyPair::generate_for(&PKCS_RSA_SHA256)?,
        };
        let signer_key = KeyPair::from_pem(&signer.key_pem)?;
        let issuer = Issuer::from_ca_cert_der(&signer.cert_der, signer_key)?;

        let now = SystemTime::now();
        let not_before = (now - VALIDITY_GRACE).max(signer.not_before);
        let not_after = (now + LEAF_VALIDITY).min(signer.not_after);

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        params.distinguished_name = dn;
        match subject.parse::<IpAddr>() {
            Ok(ip) => params.subject_alt_names.push(SanType::IpAddress(ip)),
            Err(_) => params
                .subject_alt_names
                .push(SanType::DnsName(subject.try_into()?)),
        }
        params.not_before = not_before.into();
        params.not_after = not_after.into();

        let cert = params.signed_by(&key, &issuer)?;
        Ok(CertificateMaterial {
            subject: subject.to_string(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            cert_der: cert.der().clone(),
            not_before,
            not_after,
        })
    }
}

impl CertificateEngine for RcgenEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Portable
    }

    fn make_certificate(
        &self,
        subject: &str,
        is_root: bool,
        signer: Option<&CertificateMaterial>,
    ) -> Result<CertificateMaterial, CertificateError> {
        let result = match (is_root, signer) {
            (true, _) => self.root(subject),
            (false, Some(signer)) => self.leaf(subject, signer),
            (false, None) => return Err(CertificateError::RootUnavailable),
        };
        result.map_err(|e| CertificateError::generation(subject, e))
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

/// Shells out to the host's `openssl` binary.
///
/// The tool offers no portable way to backdate `notBefore`, so native certificates start at
/// the moment of issuance.
#[derive(Debug, Clone)]
pub struct OpensslEngine {
    binary: PathBuf,
    leaf_keys: LeafKeyAlgorithm,
}

impl OpensslEngine {
    /// Succeeds only when `openssl version` runs.
    pub fn detect(leaf_keys: LeafKeyAlgorithm) -> Result<Self, CertificateError> {
        let binary = PathBuf::from("openssl");
        let output = Command::new(&binary)
            .arg("version")
            .output()
            .map_err(|e| CertificateError::EngineUnavailable(format!("openssl: {e}")))?;
        if !output.status.success() {
            return Err(CertificateError::EngineUnavailable(
                "openssl version exited unsuccessfully".into(),
            ));
        }
        tracing::debug!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "native certificate engine available"
        );
        Ok(Self { binary, leaf_keys })
    }

    fn run(&self, subject: &str, args: &[&str]) -> Result<(), CertificateError> {
        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(CertificateError::generation(
            subject,
            String::from_utf8_lossy(&output.stderr).trim(),
        ))
    }

    fn key_spec(&self, is_root: bool) -> &'static [&'static str] {
        if is_root || self.leaf_keys == LeafKeyAlgorithm::Rsa {
            &["-newkey", "rsa:2048"]
        } else {
            &["-newkey", "ec", "-pkeyopt", "ec_paramgen_curve:prime256v1"]
        }
    }

    fn read_material(
        subject: &str,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<CertificateMaterial, CertificateError> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        CertificateMaterial::from_pem(subject, cert_pem, key_pem)
    }
}

impl CertificateEngine for OpensslEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn make_certificate(
        &self,
        subject: &str,
        is_root: bool,
        signer: Option<&CertificateMaterial>,
    ) -> Result<CertificateMaterial, CertificateError> {
        if subject.is_empty() || subject.contains(['/', '\\', '\n', '\r', '=', ',']) {
            return Err(CertificateError::generation(subject, "subject not representable"));
        }
        let work = tempfile::tempdir()?;
        let key_path = work.path().join("key.pem");
        let cert_path = work.path().join("cert.pem");
        let key_arg = key_path.to_string_lossy().into_owned();
        let cert_arg = cert_path.to_string_lossy().into_owned();

        if is_root {
            let subj = format!("/CN={subject}/O={ORGANIZATION}");
            let days = (ROOT_VALIDITY.as_secs() / 86_400).to_string();
            let mut args = vec!["req", "-x509", "-sha256", "-nodes"];
            args.extend_from_slice(self.key_spec(true));
            args.extend_from_slice(&[
                "-keyout", &key_arg, "-out", &cert_arg, "-days", &days, "-subj", &subj,
                "-addext", "basicConstraints=critical,CA:TRUE",
                "-addext", "keyUsage=critical,keyCertSign,cRLSign,digitalSignature",
            ]);
            self.run(subject, &args)?;
            return Self::read_material(subject, &cert_path, &key_path);
        }

        let signer = signer.ok_or(CertificateError::RootUnavailable)?;
        let ca_cert_path = work.path().join("ca.pem");
        let ca_key_path = work.path().join("ca.key");
        let csr_path = work.path().join("leaf.csr");
        let ext_path = work.path().join("leaf.ext");
        std::fs::write(&ca_cert_path, &signer.cert_pem)?;
        std::fs::write(&ca_key_path, &signer.key_pem)?;
        let san = match subject.parse::<IpAddr>() {
            Ok(_) => format!("IP:{subject}"),
            Err(_) => format!("DNS:{subject}"),
        };
        std::fs::write(
            &ext_path,
            format!(
                "basicConstraints=CA:FALSE\nkeyUsage=digitalSignature,keyEncipherment\n\
                 extendedKeyUsage=serverAuth\nsubjectAltName={san}\n"
            ),
        )?;

        let csr_arg = csr_path.to_string_lossy().into_owned();
        let subj = format!("/CN={subject}");
        let mut args = vec!["req", "-new", "-nodes"];
        args.extend_from_slice(self.key_spec(false));
        args.extend_from_slice(&["-keyout", &key_arg, "-out", &csr_arg, "-subj", &subj]);
        self.run(subject, &args)?;

        let remaining = signer
            .not_after
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        let days = (LEAF_VALIDITY.min(remaining).as_secs() / 86_400).max(1).to_string();
        let serial = format!("0x{}", uuid::Uuid::now_v7().simple());
        let ca_cert_arg = ca_cert_path.to_string_lossy().into_owned();
        let ca_key_arg = ca_key_path.to_string_lossy().into_owned();
        let ext_arg = ext_path.to_string_lossy().into_owned();
        self.run(
            subject,
            &[
                "x509", "-req", "-sha256", "-in", &csr_arg, "-CA", &ca_cert_arg, "-CAkey",
                &ca_key_arg, "-set_serial", &serial, "-days", &days, "-extfile", &ext_arg,
                "-out", &cert_arg,
            ],
        )?;
        Self::read_material(subject, &cert_path, &key_path)
    }
}
