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

//! Interpose: a TLS-intercepting HTTP/1.x proxy core.
//!
//! The building blocks are usable on their own: [`io::FramedStream`] over any async byte
//! channel, the [`http`] codec, the [`tls::CertificateManager`] and the
//! [`pool::ConnectionPool`]. [`app::InterposeApp`] wires them into a running proxy.

pub mod app;
pub mod config;
pub mod http;
pub mod io;
pub mod keystore;
pub mod pool;
pub mod proxy;
pub mod telemetry;
pub mod tls;
pub mod utils;
