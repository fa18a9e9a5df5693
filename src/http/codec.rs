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

use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    io::{latin1_encode, FramedStream},
    utils::{ProtocolError, ProxyResult},
};

use super::{
    headers::HeaderCollection,
    message::{HttpMessage, Request, Response},
};

pub fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

pub fn parse_version(raw: &str) -> ProxyResult<Version> {
    match raw {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(ProtocolError::UnsupportedVersion(other.to_string()).into()),
    }
}

fn push_line(out: &mut Vec<u8>, line: &str) {
    out.extend_from_slice(&latin1_encode(line));
    out.extend_from_slice(b"\r\n");
}

fn encode_headers(out: &mut Vec<u8>, headers: &HeaderCollection) {
    for header in headers {
        push_line(out, &format!("{}: {}", header.name, header.value));
    }
    out.extend_from_slice(b"\r\n");
}

pub async fn write_request_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &Method,
    target: &str,
    version: Version,
) -> ProxyResult<()> {
    let mut out = Vec::with_capacity(method.as_str().len() + target.len() + 12);
    push_line(
        &mut out,
        &format!("{} {} {}", method.as_str(), target, version_str(version)),
    );
    writer.write_all(&out).await?;
    Ok(())
}

pub async fn write_response_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    version: Version,
    status: u16,
    reason: &str,
) -> ProxyResult<()> {
    let mut out = Vec::with_capacity(reason.len() + 16);
    push_line(&mut out, &format!("{} {status} {reason}", version_str(version)));
    writer.write_all(&out).await?;
    Ok(())
}

/// Writes every header followed by the blank line, as one write.
pub async fn write_headers<W: AsyncWrite + Unpin>(
    writer: &mut W,
    headers: &HeaderCollection,
) -> ProxyResult<()> {
    let mut out = Vec::with_capacity(headers.len() * 32 + 2);
    encode_headers(&mut out, headers);
    writer.write_all(&out).await?;
    Ok(())
}

/// Emits request line + headers and locks the request.
pub async fn write_request_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &mut Request,
) -> ProxyResult<()> {
    let mut out = Vec::with_capacity(256);
    push_line(
        &mut out,
        &format!(
            "{} {} {}",
            request.method().as_str(),
            request.target(),
            version_str(request.version())
        ),
    );
    encode_headers(&mut out, request.headers());
    writer.write_all(&out).await?;
    writer.flush().await?;
    request.lock();
    Ok(())
}

/// Emits status line + headers and locks the response.
pub async fn write_response_head<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &mut Response,
) -> ProxyResult<()> {
    let mut out = Vec::with_capacity(256);
    push_line(
        &mut out,
        &format!(
            "{} {} {}",
            version_str(response.version()),
            response.status(),
            response.reason()
        ),
    );
    encode_headers(&mut out, response.headers());
    writer.write_all(&out).await?;
    writer.flush().await?;
    response.lock();
    Ok(())
}

/// Reads header lines up to the blank separator line.
///
/// A line without `:` fails the message. The stream ending inside the block terminates it.
pub async fn read_headers<S: AsyncRead + Unpin>(
    stream: &mut FramedStream<S>,
) -> ProxyResult<HeaderCollection> {
    let mut headers = HeaderCollection::new();
    while let Some(line) = stream.read_line().await? {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(ProtocolError::MalformedHeader(line).into());
        };
        headers.add(name.trim(), value.trim());
    }
    Ok(headers)
}

pub fn parse_request_line(line: &str) -> ProxyResult<(Method, String, Version)> {
    let malformed = || ProtocolError::MalformedRequestLine(line.to_string());
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed().into());
    };
    let method = Method::from_bytes(method.as_bytes()).map_err(|_| malformed())?;
    Ok((method, target.to_string(), parse_version(version)?))
}

pub fn parse_status_line(line: &str) -> ProxyResult<(Version, u16, String)> {
    let malformed = || ProtocolError::MalformedStatusLine(line.to_string());
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().ok_or_else(malformed)?;
    let code = parts.next().ok_or_else(malformed)?;
    let reason = parts.next().unwrap_or("").trim();
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed().into());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    Ok((parse_version(version)?, status, reason.to_string()))
}

/// Reads a request head. `None` on a clean end of stream before the request line.
pub async fn read_request<S: AsyncRead + Unpin>(
    stream: &mut FramedStream<S>,
) -> ProxyResult<Option<Request>> {
    let line = loop {
        match stream.read_line().await? {
            None => return Ok(None),
            // Stray CRLFs between pipelined requests are tolerated.
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };
    let (method, target, version) = parse_request_line(&line)?;
    let headers = read_headers(stream).await?;
    Ok(Some(Request::new(method, target, version).with_headers(headers)))
}

/// Reads a response head. `None` on a clean end of stream before the status line.
pub async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut FramedStream<S>,
) -> ProxyResult<Option<Response>> {
    let Some(line) = stream.read_line().await? else {
        return Ok(None);
    };
    let (version, status, reason) = parse_status_line(&line)?;
    let headers = read_headers(stream).await?;
    Ok(Some(Response::new(version, status, reason).with_headers(headers)))
}
