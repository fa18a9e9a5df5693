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

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    http::HttpMessage,
    proxy::flow::Flow,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Flow events go through `tracing` like everything else.
    #[default]
    Stdout,
    /// One JSON object per line on stdout, for ingestion pipelines.
    Json,
    Off,
}

#[derive(Clone, Debug)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(mode: TelemetryMode) -> Self {
        Self { mode }
    }

    pub fn disabled() -> Self {
        Self::new(TelemetryMode::Off)
    }

    pub fn emit(&self, event: &str, flow_id: Uuid, payload: Value) {
        match self.mode {
            TelemetryMode::Off => {}
            TelemetryMode::Stdout => {
                tracing::info!(%flow_id, event, payload = %payload);
            }
            TelemetryMode::Json => {
                let data = json!({
                    "event": event,
                    "flow_id": flow_id,
                    "payload": payload,
                });
                println!("{data}");
            }
        }
    }

    /// Summary of a finished exchange.
    pub fn flow_completed(&self, flow: &Flow) {
        if self.mode == TelemetryMode::Off {
            return;
        }
        let meta = &flow.metadata;
        let timings = meta.upstream_timings.map(|t| {
            json!({
                "dns_ms": t.dns_resolved.map(|d| d.as_millis() as u64),
                "tcp_ms": t.tcp_connected.map(|d| d.as_millis() as u64),
                "tunnel_ms": t.tunnel_established.map(|d| d.as_millis() as u64),
                "tls_ms": t.tls_established.map(|d| d.as_millis() as u64),
            })
        });
        let payload = json!({
            "client": flow.client_addr.to_string(),
            "method": flow.request.method().as_str(),
            "target": flow.request.target(),
            "host": meta.target.host,
            "port": meta.target.port,
            "https": meta.target.is_https,
            "sni": meta.sni,
            "status": flow.response.as_ref().map(|r| r.status()),
            "request_bytes": meta.request_body_bytes,
            "response_bytes": meta.response_body_bytes,
            "upstream": meta.upstream_addr.map(|a| a.to_string()),
            "reused": meta.upstream_reused,
            "local": meta.answered_locally,
            "timings": timings,
            "version": format!("{:?}", flow.request.version()),
        });
        self.emit("flow_completed", flow.id, payload);
    }
}
