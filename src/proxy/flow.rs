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

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    http::{
        form_data_boundary, names, HeaderCollection, HttpMessage, MultipartScanner, Request,
        Response,
    },
    pool::ConnectionTimings,
    utils::ProxyResult,
};

/// Flow tracks one request/response exchange as it moves through a session.
///
/// A Flow is created once the request head has been parsed, passed through the stage
/// pipeline, forwarded upstream, and reported to telemetry after the response has been
/// delivered to the client. Flows are owned by the session task, so stages mutate them
/// through `&mut` without extra synchronization.
#[derive(Debug)]
pub struct Flow {
    /// UUID v7, so flow ids sort by creation time in logs.
    pub id: Uuid,
    pub client_addr: SocketAddr,
    pub request: Request,
    /// `None` until the upstream answers (or a stage answers in its place).
    pub response: Option<Response>,
    pub metadata: FlowMetadata,
}

impl Flow {
    pub fn new(client_addr: SocketAddr, request: Request, target: FlowTarget) -> Self {
        Self {
            id: Uuid::now_v7(),
            client_addr,
            request,
            response: None,
            metadata: FlowMetadata {
                target,
                ..FlowMetadata::default()
            },
        }
    }
}

/// Where the request is headed, after absolute-form and tunnel context are resolved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowTarget {
    pub host: String,
    pub port: u16,
    pub is_https: bool,
}

/// Facts recorded along the way, for stages and telemetry.
#[derive(Debug, Default)]
pub struct FlowMetadata {
    pub target: FlowTarget,
    /// SNI the client sent inside a CONNECT tunnel.
    pub sni: Option<String>,
    pub upstream_addr: Option<SocketAddr>,
    pub upstream_reused: bool,
    pub upstream_timings: Option<ConnectionTimings>,
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
    /// Set when a stage answered the request without contacting the origin.
    pub answered_locally: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

/// What a stage wants done with a request once it has seen the head.
#[derive(Debug)]
pub enum RequestAction {
    Forward,
    /// Read the whole body into `flow.request` before forwarding.
    Buffer,
    /// Answer the client directly; the request body is drained and dropped.
    Respond(Response),
}

/// Whether the response body streams through or is materialized first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyPolicy {
    #[default]
    Stream,
    /// Read (and decompress) the body into `flow.response` before it is sent on.
    Buffer,
}

/// Hook points a session calls for every flow.
///
/// `on_body_bytes` runs synchronously on the copy path and must not block.
#[async_trait]
pub trait FlowStage: Send + Sync {
    async fn on_request(&self, _flow: &mut Flow) -> ProxyResult<RequestAction> {
        Ok(RequestAction::Forward)
    }

    /// Only called when some stage asked for [`RequestAction::Buffer`].
    async fn on_request_body(&self, _flow: &mut Flow) -> ProxyResult<()> {
        Ok(())
    }

    async fn on_response_headers(&self, _flow: &mut Flow) -> ProxyResult<BodyPolicy> {
        Ok(BodyPolicy::Stream)
    }

    /// Only called when some stage asked for [`BodyPolicy::Buffer`].
    async fn on_response_body(&self, _flow: &mut Flow) -> ProxyResult<()> {
        Ok(())
    }

    fn on_body_bytes(&self, _flow_id: Uuid, _direction: Direction, _bytes: &[u8]) {}

    /// Returning `true` has the session scan a `multipart/form-data` request body and
    /// report each part's header block to [`FlowStage::on_multipart_part`].
    fn wants_multipart_parts(&self, _flow: &Flow) -> bool {
        false
    }

    fn on_multipart_part(&self, _flow_id: Uuid, _index: usize, _headers: &HeaderCollection) {}
}

/// The ordered stages run for every flow.
#[derive(Clone, Default)]
pub struct StagePipeline {
    stages: Arc<Vec<Arc<dyn FlowStage>>>,
}

impl std::fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagePipeline")
            .field("stages", &self.stages.len())
            .finish()
    }
}

impl StagePipeline {
    pub fn new(stages: Vec<Arc<dyn FlowStage>>) -> Self {
        Self {
            stages: Arc::new(stages),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The first stage that answers wins; `Buffer` from any stage sticks.
    pub async fn process_request(&self, flow: &mut Flow) -> ProxyResult<RequestAction> {
        let mut buffer = false;
        for stage in self.stages.iter() {
            match stage.on_request(flow).await? {
                RequestAction::Forward => {}
                RequestAction::Buffer => buffer = true,
                respond @ RequestAction::Respond(_) => return Ok(respond),
            }
        }
        Ok(if buffer {
            RequestAction::Buffer
        } else {
            RequestAction::Forward
        })
    }

    pub async fn process_request_body(&self, flow: &mut Flow) -> ProxyResult<()> {
        for stage in self.stages.iter() {
            stage.on_request_body(flow).await?;
        }
        Ok(())
    }

    pub async fn process_response_headers(&self, flow: &mut Flow) -> ProxyResult<BodyPolicy> {
        let mut policy = BodyPolicy::Stream;
        for stage in self.stages.iter() {
            if stage.on_response_headers(flow).await? == BodyPolicy::Buffer {
                policy = BodyPolicy::Buffer;
            }
        }
        Ok(policy)
    }

    pub async fn process_response_body(&self, flow: &mut Flow) -> ProxyResult<()> {
        for stage in self.stages.iter() {
            stage.on_response_body(flow).await?;
        }
        Ok(())
    }

    pub fn observe(&self, flow_id: Uuid, direction: Direction, bytes: &[u8]) {
        for stage in self.stages.iter() {
            stage.on_body_bytes(flow_id, direction, bytes);
        }
    }

    /// A part scanner for the request body, when some stage wants part headers and the
    /// body is `multipart/form-data`.
    pub fn multipart_scanner(&self, flow: &Flow) -> Option<MultipartScanner> {
        if !self.stages.iter().any(|stage| stage.wants_multipart_parts(flow)) {
            return None;
        }
        let content_type = flow.request.headers().get_first(names::CONTENT_TYPE)?;
        form_data_boundary(content_type).map(|boundary| MultipartScanner::new(&boundary))
    }

    pub fn multipart_part(&self, flow_id: Uuid, index: usize, headers: &HeaderCollection) {
        for stage in self.stages.iter() {
            stage.on_multipart_part(flow_id, index, headers);
        }
    }
}

/// Synthesizes a small plain-text response, e.g. for upstream failures.
pub fn text_response(status: u16, text: &str) -> ProxyResult<Response> {
    let mut response = Response::with_status(status);
    let headers = response.headers_mut()?;
    headers.set(names::CONTENT_TYPE, "text/plain; charset=utf-8");
    headers.set(names::CONNECTION, "close");
    response.set_body(Bytes::copy_from_slice(text.as_bytes()))?;
    Ok(response)
}
