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

use bytes::Bytes;
use http::{Method, Version};

use crate::utils::{ProtocolError, ProxyResult};

use super::{body::BodyFraming, headers::HeaderCollection, names};

/// Header/body state shared by requests and responses.
///
/// Once `locked` is set (the head has been written to the other side) every mutation fails
/// with [`ProtocolError::MessageLocked`].
#[derive(Debug, Clone, Default)]
pub struct MessageState {
    headers: HeaderCollection,
    body: Option<Bytes>,
    is_body_read: bool,
    locked: bool,
}

impl MessageState {
    pub fn new(headers: HeaderCollection) -> Self {
        Self {
            headers,
            ..Self::default()
        }
    }
}

/// Behaviour common to [`Request`] and [`Response`].
pub trait HttpMessage {
    fn state(&self) -> &MessageState;
    fn state_mut(&mut self) -> &mut MessageState;
    fn version(&self) -> Version;

    fn headers(&self) -> &HeaderCollection {
        &self.state().headers
    }

    fn headers_mut(&mut self) -> ProxyResult<&mut HeaderCollection> {
        let state = self.state_mut();
        if state.locked {
            return Err(ProtocolError::MessageLocked.into());
        }
        Ok(&mut state.headers)
    }

    fn is_locked(&self) -> bool {
        self.state().locked
    }

    fn lock(&mut self) {
        self.state_mut().locked = true;
    }

    fn is_body_read(&self) -> bool {
        self.state().is_body_read
    }

    fn body(&self) -> Option<&Bytes> {
        self.state().body.as_ref()
    }

    /// Drops the materialized body; used at session end unless the caller keeps it.
    fn take_body(&mut self) -> Option<Bytes> {
        self.state_mut().body.take()
    }

    /// Stores a body that was read off the wire (already de-framed and decoded).
    /// Framing headers are left as they are.
    fn store_body(&mut self, body: Bytes) -> ProxyResult<()> {
        let state = self.state_mut();
        if state.locked {
            return Err(ProtocolError::MessageLocked.into());
        }
        state.body = Some(body);
        state.is_body_read = true;
        Ok(())
    }

    /// Replaces the body and rewrites the framing headers to match it.
    fn set_body(&mut self, body: Bytes) -> ProxyResult<()> {
        if self.is_locked() {
            return Err(ProtocolError::MessageLocked.into());
        }
        let len = body.len() as i64;
        self.store_body(body)?;
        self.set_content_length(len)
    }

    /// `-1` when no Content-Length header is present.
    fn content_length(&self) -> ProxyResult<i64> {
        let mut found: Option<i64> = None;
        for raw in self.headers().get_all(names::CONTENT_LENGTH) {
            let parsed = raw
                .trim()
                .parse::<u64>()
                .ok()
                .and_then(|v| i64::try_from(v).ok())
                .ok_or_else(|| ProtocolError::InvalidContentLength(raw.to_string()))?;
            match found {
                Some(previous) if previous != parsed => {
                    return Err(ProtocolError::InvalidContentLength(raw.to_string()).into())
                }
                _ => found = Some(parsed),
            }
        }
        Ok(found.unwrap_or(-1))
    }

    /// Sets Content-Length (removing chunked framing) or removes it when `len < 0`.
    fn set_content_length(&mut self, len: i64) -> ProxyResult<()> {
        let headers = self.headers_mut()?;
        if len >= 0 {
            headers.remove(names::TRANSFER_ENCODING);
            headers.set(names::CONTENT_LENGTH, len.to_string());
        } else {
            headers.remove(names::CONTENT_LENGTH);
        }
        Ok(())
    }

    fn is_chunked(&self) -> bool {
        self.headers()
            .has_token(names::TRANSFER_ENCODING, names::CHUNKED)
    }

    /// Switches chunked framing on (removing Content-Length) or off.
    fn set_chunked(&mut self, chunked: bool) -> ProxyResult<()> {
        let headers = self.headers_mut()?;
        if chunked {
            headers.remove(names::CONTENT_LENGTH);
            headers.set(names::TRANSFER_ENCODING, names::CHUNKED);
        } else {
            headers.remove(names::TRANSFER_ENCODING);
        }
        Ok(())
    }

    fn content_encoding(&self) -> Option<String> {
        self.headers()
            .get_first(names::CONTENT_ENCODING)
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty() && v != "identity")
    }

    fn content_type(&self) -> Option<&str> {
        self.headers().get_first(names::CONTENT_TYPE)
    }

    /// True when either side asked for the connection to end after this message.
    fn wants_close(&self) -> bool {
        let headers = self.headers();
        if headers.has_token(names::CONNECTION, "close")
            || headers.has_token(names::PROXY_CONNECTION, "close")
        {
            return true;
        }
        self.version() == Version::HTTP_10
            && !headers.has_token(names::CONNECTION, "keep-alive")
            && !headers.has_token(names::PROXY_CONNECTION, "keep-alive")
    }

    fn framing(&self) -> ProxyResult<BodyFraming> {
        let is_chunked = self.is_chunked();
        let content_length = if is_chunked { -1 } else { self.content_length()? };
        Ok(BodyFraming {
            content_length,
            is_chunked,
            content_encoding: self.content_encoding(),
        })
    }
}

/// Parsed request head plus lazily materialized body.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    state: MessageState,
}

impl Request {
    pub fn new(method: Method, target: impl Into<String>, version: Version) -> Self {
        Self {
            method,
            target: target.into(),
            version,
            state: MessageState::default(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderCollection) -> Self {
        self.state = MessageState::new(headers);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: impl Into<String>) -> ProxyResult<()> {
        if self.is_locked() {
            return Err(ProtocolError::MessageLocked.into());
        }
        self.target = target.into();
        Ok(())
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn expects_continue(&self) -> bool {
        self.headers()
            .get_first(names::EXPECT)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }

    /// Whether a body follows the head on the wire.
    ///
    /// An HTTP/1.0 `POST` with neither length nor chunking still carries a body, delimited
    /// by the client closing its side.
    pub fn has_body(&self) -> ProxyResult<bool> {
        if self.is_chunked() {
            return Ok(true);
        }
        match self.content_length()? {
            len if len > 0 => Ok(true),
            0 => Ok(false),
            _ => Ok(self.version == Version::HTTP_10 && self.method == Method::POST),
        }
    }

    /// Framing for copying this request's body; no body means a zero-length copy.
    pub fn body_framing(&self) -> ProxyResult<BodyFraming> {
        if !self.has_body()? {
            return Ok(BodyFraming::empty());
        }
        self.framing()
    }
}

impl HttpMessage for Request {
    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn version(&self) -> Version {
        self.version
    }
}

/// Parsed status line and headers plus lazily materialized body.
#[derive(Debug, Clone)]
pub struct Response {
    version: Version,
    status: u16,
    reason: String,
    state: MessageState,
}

impl Response {
    pub fn new(version: Version, status: u16, reason: impl Into<String>) -> Self {
        Self {
            version,
            status,
            reason: reason.into(),
            state: MessageState::default(),
        }
    }

    /// Builds a response with the canonical reason phrase for `status`.
    pub fn with_status(status: u16) -> Self {
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("");
        Self::new(Version::HTTP_11, status, reason)
    }

    pub fn with_headers(mut self, headers: HeaderCollection) -> Self {
        self.state = MessageState::new(headers);
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status)
    }

    /// Whether a body follows the head, given the method of the request it answers.
    pub fn has_body(&self, request_method: &Method) -> ProxyResult<bool> {
        if request_method == Method::HEAD
            || self.is_informational()
            || self.status == 204
            || self.status == 304
        {
            return Ok(false);
        }
        if request_method == Method::CONNECT && (200..300).contains(&self.status) {
            return Ok(false);
        }
        if self.is_chunked() {
            return Ok(true);
        }
        Ok(self.content_length()? != 0)
    }

    /// True when the body runs until the server closes the connection.
    pub fn is_close_delimited(&self, request_method: &Method) -> ProxyResult<bool> {
        Ok(self.has_body(request_method)? && !self.is_chunked() && self.content_length()? < 0)
    }

    pub fn body_framing(&self, request_method: &Method) -> ProxyResult<BodyFraming> {
        if !self.has_body(request_method)? {
            return Ok(BodyFraming::empty());
        }
        self.framing()
    }
}

impl HttpMessage for Response {
    fn state(&self) -> &MessageState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut MessageState {
        &mut self.state
    }

    fn version(&self) -> Version {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderCollection {
        let mut h = HeaderCollection::new();
        for (n, v) in pairs {
            h.add(*n, *v);
        }
        h
    }

    #[test]
    fn content_length_and_chunked_are_exclusive() {
        let mut req = Request::new(Method::POST, "/", Version::HTTP_11)
            .with_headers(headers(&[("Content-Length", "10")]));
        req.set_chunked(true).unwrap();
        assert!(req.is_chunked());
        assert_eq!(req.content_length().unwrap(), -1);

        req.set_content_length(4).unwrap();
        assert!(!req.is_chunked());
        assert_eq!(req.content_length().unwrap(), 4);
    }

    #[test]
    fn locked_messages_reject_mutation() {
        let mut resp = Response::with_status(200);
        resp.lock();
        assert!(resp.headers_mut().is_err());
        assert!(resp.set_body(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn locked_messages_reject_stored_bodies() {
        let mut req = Request::new(Method::POST, "/", Version::HTTP_11);
        req.store_body(Bytes::from_static(b"first")).unwrap();
        req.lock();
        let err = req.store_body(Bytes::from_static(b"second")).unwrap_err();
        assert!(matches!(
            err,
            crate::utils::ProxyError::Protocol(ProtocolError::MessageLocked)
        ));
        assert_eq!(req.body().map(|b| b.as_ref()), Some(&b"first"[..]));
    }

    #[test]
    fn invalid_content_length_is_an_error() {
        let req = Request::new(Method::POST, "/", Version::HTTP_11)
            .with_headers(headers(&[("Content-Length", "ten")]));
        assert!(req.content_length().is_err());
    }

    #[test]
    fn http10_post_without_length_has_body() {
        let req = Request::new(Method::POST, "/", Version::HTTP_10);
        assert!(req.has_body().unwrap());
        let get = Request::new(Method::GET, "/", Version::HTTP_10);
        assert!(!get.has_body().unwrap());
    }

    #[test]
    fn close_delimited_response_detection() {
        let resp = Response::with_status(200).with_headers(headers(&[("Connection", "close")]));
        assert!(resp.is_close_delimited(&Method::GET).unwrap());
        assert!(!resp.has_body(&Method::HEAD).unwrap());

        let no_content = Response::with_status(204);
        assert!(!no_content.has_body(&Method::GET).unwrap());
    }
}
