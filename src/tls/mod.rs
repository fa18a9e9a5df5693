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

//! TLS plumbing: ClientHello sniffing, certificate issuance and the rustls configs on both sides.

pub mod acceptor;
pub mod cert;
pub mod engine;
pub mod sniff;
pub mod upstream;

pub use cert::{CertificateFailure, CertificateManager, CertificateMetrics};
pub use engine::{CertificateEngine, CertificateMaterial, EngineKind, LeafKeyAlgorithm};
pub use sniff::{looks_like_tls, peek_client_hello, ClientHello};
pub use upstream::{
    AcceptAnyCertificate, ClientCertificateSelector, ServerCertificateContext,
    ServerCertificateValidator, StandardValidation, TlsVersion, UpstreamTls,
};
