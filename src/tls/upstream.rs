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

use std::{fmt, sync::Arc};

use dashmap::DashMap;
use rustls::{
    client::{
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        ResolvesClientCert, WebPkiServerVerifier,
    },
    crypto::{aws_lc_rs, CryptoProvider},
    pki_types::{CertificateDer, ServerName, UnixTime},
    sign::CertifiedKey,
    version::{TLS12, TLS13},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme, SupportedProtocolVersion,
};
use serde::Deserialize;

use crate::utils::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "tls1.2")]
    Tls12,
    #[serde(rename = "tls1.3")]
    Tls13,
}

impl TlsVersion {
    fn rustls(self) -> &'static SupportedProtocolVersion {
        match self {
            TlsVersion::Tls12 => &TLS12,
            TlsVersion::Tls13 => &TLS13,
        }
    }
}

/// What an upstream certificate looked like and what standard validation thought of it.
#[derive(Debug)]
pub struct ServerCertificateContext<'a> {
    pub server_name: String,
    pub end_entity: &'a CertificateDer<'a>,
    pub intermediates: &'a [CertificateDer<'a>],
    /// `None` when the chain validated against the trust roots.
    pub webpki_error: Option<&'a rustls::Error>,
}

/// Embedding applications decide whether an upstream certificate is acceptable.
pub trait ServerCertificateValidator: Send + Sync + fmt::Debug {
    fn validate(&self, context: &ServerCertificateContext<'_>) -> bool;
}

/// Accepts exactly what standard chain validation accepts.
#[derive(Debug, Default)]
pub struct StandardValidation;

impl ServerCertificateValidator for StandardValidation {
    fn validate(&self, context: &ServerCertificateContext<'_>) -> bool {
        context.webpki_error.is_none()
    }
}

/// Accepts every certificate. For test rigs and deliberately insecure setups.
#[derive(Debug, Default)]
pub struct AcceptAnyCertificate;

impl ServerCertificateValidator for AcceptAnyCertificate {
    fn validate(&self, context: &ServerCertificateContext<'_>) -> bool {
        if let Some(err) = context.webpki_error {
            tracing::debug!(server = %context.server_name, error = %err, "accepting invalid upstream certificate");
        }
        true
    }
}

/// Supplies a client certificate when an upstream server asks for one.
pub trait ClientCertificateSelector: Send + Sync + fmt::Debug {
    fn select(
        &self,
        acceptable_issuers: &[&[u8]],
        schemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>>;
}

#[derive(Debug)]
struct SelectorResolver(Arc<dyn ClientCertificateSelector>);

impl ResolvesClientCert for SelectorResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.0.select(root_hint_subjects, sigschemes)
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Runs webpki first, then lets the validator overrule it either way.
#[derive(Debug)]
struct CallbackVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    validator: Arc<dyn ServerCertificateValidator>,
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verdict =
            self.webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now);
        let context = ServerCertificateContext {
            server_name: server_name.to_str().into_owned(),
            end_entity,
            intermediates,
            webpki_error: verdict.as_ref().err(),
        };
        if self.validator.validate(&context) {
            return Ok(ServerCertVerified::assertion());
        }
        match verdict {
            Err(err) => Err(err),
            Ok(_) => Err(rustls::Error::General(
                "upstream certificate rejected by validator".into(),
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

/// Builds (and caches per ALPN list) the client configuration used toward origin servers.
pub struct UpstreamTls {
    provider: Arc<CryptoProvider>,
    versions: Vec<&'static SupportedProtocolVersion>,
    roots: Arc<RootCertStore>,
    validator: Arc<dyn ServerCertificateValidator>,
    client_certs: Option<Arc<dyn ClientCertificateSelector>>,
    configs: DashMap<Vec<String>, Arc<ClientConfig>>,
}

impl fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamTls")
            .field("versions", &self.versions.len())
            .field("validator", &self.validator)
            .field("cached_configs", &self.configs.len())
            .finish()
    }
}

impl UpstreamTls {
    /// Trusts the bundled web roots plus `extra_roots`.
    pub fn new(versions: &[TlsVersion], extra_roots: &[CertificateDer<'static>]) -> ProxyResult<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for root in extra_roots {
            roots
                .add(root.clone())
                .map_err(|e| ProxyError::TlsHandshake(format!("invalid extra root: {e}")))?;
        }
        let mut versions: Vec<&'static SupportedProtocolVersion> =
            versions.iter().map(|v| v.rustls()).collect();
        if versions.is_empty() {
            versions = vec![&TLS13, &TLS12];
        }
        Ok(Self {
            provider: Arc::new(aws_lc_rs::default_provider()),
            versions,
            roots: Arc::new(roots),
            validator: Arc::new(StandardValidation),
            client_certs: None,
            configs: DashMap::new(),
        })
    }

    pub fn with_validator(mut self, validator: Arc<dyn ServerCertificateValidator>) -> Self {
        self.validator = validator;
        self.configs.clear();
        self
    }

    pub fn with_client_certificates(mut self, selector: Arc<dyn ClientCertificateSelector>) -> Self {
        self.client_certs = Some(selector);
        self.configs.clear();
        self
    }

    pub fn client_config(&self, alpn: &[String]) -> ProxyResult<Arc<ClientConfig>> {
        if let Some(config) = self.configs.get(alpn) {
            return Ok(Arc::clone(config.value()));
        }
        let config = Arc::new(self.build(alpn)?);
        self.configs.insert(alpn.to_vec(), Arc::clone(&config));
        Ok(config)
    }

    fn build(&self, alpn: &[String]) -> ProxyResult<ClientConfig> {
        let webpki = WebPkiServerVerifier::builder_with_provider(
            Arc::clone(&self.roots),
            Arc::clone(&self.provider),
        )
        .build()
        .map_err(|e| ProxyError::TlsHandshake(format!("verifier: {e}")))?;
        let verifier = Arc::new(CallbackVerifier {
            webpki,
            validator: Arc::clone(&self.validator),
        });

        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&self.versions)
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);
        let mut config = match &self.client_certs {
            Some(selector) => {
                builder.with_client_cert_resolver(Arc::new(SelectorResolver(Arc::clone(selector))))
            }
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(config)
    }
}
