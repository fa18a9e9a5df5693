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

//! HTTP/1.x message framing on top of [`crate::io::FramedStream`].

pub mod body;
pub mod codec;
pub mod compression;
pub mod headers;
pub mod message;
pub mod multipart;

pub use body::{
    copy_body, read_body, syphon_body, write_body, BodyFraming, BodyReader, ByteObserver,
    FramingMode,
};
pub use codec::{
    read_headers, read_request, read_response, write_headers, write_request_head,
    write_request_line, write_response_head, write_response_line,
};
pub use compression::{DecompressionProvider, DefaultDecompression};
pub use headers::{HeaderCollection, HttpHeader};
pub use message::{HttpMessage, Request, Response};
pub use multipart::{form_data_boundary, MultipartScanner};

/// Header names the proxy itself inspects or rewrites.
pub mod names {
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_ENCODING: &str = "Content-Encoding";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const EXPECT: &str = "Expect";
    pub const HOST: &str = "Host";
    pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
    pub const PROXY_CONNECTION: &str = "Proxy-Connection";
    pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
    pub const UPGRADE: &str = "Upgrade";
    pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";

    pub const CHUNKED: &str = "chunked";
}
