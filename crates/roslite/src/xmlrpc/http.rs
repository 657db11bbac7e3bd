// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal HTTP/1.1 framing for XML-RPC exchanges.
//!
//! Only what the protocol needs: building POST requests and 200 responses,
//! and incrementally parsing their counterparts out of a [`ByteBuffer`].
//! Parsing is resumable: feed bytes into the channel buffer as they arrive
//! and call `advance` until it reports [`ParseStatus::Done`].

use crate::buffer::ByteBuffer;
use crate::error::{ErrorKind, ErrorPack};

/// Largest accepted HTTP body (matches the XML-RPC payloads we exchange).
const MAX_BODY: usize = 4 * 1024 * 1024;

/// Progress of an incremental parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// More bytes are needed.
    Incomplete,
    /// A full message was consumed from the buffer.
    Done,
}

/// Build an XML-RPC POST request.
pub fn build_post_request(host: &str, port: u16, body: &str) -> Vec<u8> {
    let head = format!(
        "POST /RPC2 HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         User-Agent: roslite\r\n\
         Content-Type: text/xml\r\n\
         Content-Length: {}\r\n\
         \r\n",
        host,
        port,
        body.len()
    );
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

/// Build a 200 response carrying an XML-RPC body.
pub fn build_ok_response(body: &str) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Server: roslite\r\n\
         Content-Type: text/xml\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        body.len()
    );
    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

// ============================================================================
// Incremental parsers
// ============================================================================

/// Incremental parser for inbound HTTP requests (negotiation server side).
#[derive(Debug, Default)]
pub struct HttpRequestParser {
    content_length: Option<usize>,
    body: Option<String>,
}

impl HttpRequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume as much of `buf` as possible.
    ///
    /// On [`ParseStatus::Done`] the request (head + body) has been removed
    /// from the buffer and the body is available via [`take_body`].
    ///
    /// [`take_body`]: HttpRequestParser::take_body
    pub fn advance(&mut self, buf: &mut ByteBuffer) -> Result<ParseStatus, ErrorPack> {
        if self.body.is_some() {
            return Ok(ParseStatus::Done);
        }

        if self.content_length.is_none() {
            let head_len = match find_head_end(buf.as_slice()) {
                Some(n) => n,
                None => return Ok(ParseStatus::Incomplete),
            };
            let head = std::str::from_utf8(&buf.as_slice()[..head_len])
                .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;

            let mut lines = head.split("\r\n");
            let request_line = lines.next().unwrap_or("");
            if !request_line.starts_with("POST") {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            let length = parse_content_length(lines)?;
            if length > MAX_BODY {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            buf.consume(head_len);
            self.content_length = Some(length);
        }

        let length = self.content_length.unwrap_or(0);
        match buf.take(length) {
            Some(bytes) => {
                let body = String::from_utf8(bytes)
                    .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
                self.body = Some(body);
                Ok(ParseStatus::Done)
            }
            None => Ok(ParseStatus::Incomplete),
        }
    }

    /// Take the parsed body and reset for the next request.
    pub fn take_body(&mut self) -> Option<String> {
        let body = self.body.take();
        if body.is_some() {
            self.content_length = None;
        }
        body
    }
}

/// Incremental parser for inbound HTTP responses (RPC client side).
#[derive(Debug, Default)]
pub struct HttpResponseParser {
    content_length: Option<usize>,
    body: Option<String>,
}

impl HttpResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume as much of `buf` as possible.
    ///
    /// A non-200 status line fails with `rpc-server-refused`.
    pub fn advance(&mut self, buf: &mut ByteBuffer) -> Result<ParseStatus, ErrorPack> {
        if self.body.is_some() {
            return Ok(ParseStatus::Done);
        }

        if self.content_length.is_none() {
            let head_len = match find_head_end(buf.as_slice()) {
                Some(n) => n,
                None => return Ok(ParseStatus::Incomplete),
            };
            let head = std::str::from_utf8(&buf.as_slice()[..head_len])
                .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;

            let mut lines = head.split("\r\n");
            let status_line = lines.next().unwrap_or("");
            let status = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse::<u16>().ok())
                .ok_or_else(|| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
            if status != 200 {
                return Err(ErrorPack::new(ErrorKind::RpcServerRefused));
            }
            let length = parse_content_length(lines)?;
            if length > MAX_BODY {
                return Err(ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
            buf.consume(head_len);
            self.content_length = Some(length);
        }

        let length = self.content_length.unwrap_or(0);
        match buf.take(length) {
            Some(bytes) => {
                let body = String::from_utf8(bytes)
                    .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed))?;
                self.body = Some(body);
                Ok(ParseStatus::Done)
            }
            None => Ok(ParseStatus::Incomplete),
        }
    }

    /// Take the parsed body and reset for the next response.
    pub fn take_body(&mut self) -> Option<String> {
        let body = self.body.take();
        if body.is_some() {
            self.content_length = None;
        }
        body
    }

    /// Reset any partial state (after a reconnect).
    pub fn reset(&mut self) {
        self.content_length = None;
        self.body = None;
    }
}

/// Offset one past the blank line terminating the header block.
fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Extract Content-Length from header lines; absent means zero.
fn parse_content_length<'a>(lines: impl Iterator<Item = &'a str>) -> Result<usize, ErrorPack> {
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ErrorPack::new(ErrorKind::ProtocolMalformed));
            }
        }
    }
    Ok(0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_post_request() {
        let req = build_post_request("10.0.0.1", 11311, "<xml/>");
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("POST /RPC2 HTTP/1.1\r\n"));
        assert!(text.contains("Host: 10.0.0.1:11311\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n<xml/>"));
    }

    #[test]
    fn test_request_parse_whole() {
        let mut buf = ByteBuffer::new();
        buf.append(&build_post_request("h", 1, "<body/>"));

        let mut parser = HttpRequestParser::new();
        assert_eq!(parser.advance(&mut buf).unwrap(), ParseStatus::Done);
        assert_eq!(parser.take_body().unwrap(), "<body/>");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_request_parse_byte_by_byte() {
        let raw = build_post_request("h", 1, "<b>xy</b>");
        let mut buf = ByteBuffer::new();
        let mut parser = HttpRequestParser::new();

        for (i, byte) in raw.iter().enumerate() {
            buf.append(&[*byte]);
            let status = parser.advance(&mut buf).unwrap();
            if i + 1 < raw.len() {
                assert_eq!(status, ParseStatus::Incomplete);
            } else {
                assert_eq!(status, ParseStatus::Done);
            }
        }
        assert_eq!(parser.take_body().unwrap(), "<b>xy</b>");
    }

    #[test]
    fn test_request_parser_resets_after_take() {
        let mut buf = ByteBuffer::new();
        buf.append(&build_post_request("h", 1, "one"));
        buf.append(&build_post_request("h", 1, "two"));

        let mut parser = HttpRequestParser::new();
        assert_eq!(parser.advance(&mut buf).unwrap(), ParseStatus::Done);
        assert_eq!(parser.take_body().unwrap(), "one");
        assert_eq!(parser.advance(&mut buf).unwrap(), ParseStatus::Done);
        assert_eq!(parser.take_body().unwrap(), "two");
    }

    #[test]
    fn test_non_post_rejected() {
        let mut buf = ByteBuffer::new();
        buf.append(b"GET / HTTP/1.1\r\nContent-Length: 0\r\n\r\n");

        let mut parser = HttpRequestParser::new();
        let err = parser.advance(&mut buf).unwrap_err();
        assert_eq!(err.first(), ErrorKind::ProtocolMalformed);
    }

    #[test]
    fn test_response_parse() {
        let mut buf = ByteBuffer::new();
        buf.append(&build_ok_response("<r/>"));

        let mut parser = HttpResponseParser::new();
        assert_eq!(parser.advance(&mut buf).unwrap(), ParseStatus::Done);
        assert_eq!(parser.take_body().unwrap(), "<r/>");
    }

    #[test]
    fn test_response_non_200_refused() {
        let mut buf = ByteBuffer::new();
        buf.append(b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");

        let mut parser = HttpResponseParser::new();
        let err = parser.advance(&mut buf).unwrap_err();
        assert_eq!(err.first(), ErrorKind::RpcServerRefused);
    }

    #[test]
    fn test_response_garbage_status_line() {
        let mut buf = ByteBuffer::new();
        buf.append(b"NOT-HTTP\r\n\r\n");

        let mut parser = HttpResponseParser::new();
        assert!(parser.advance(&mut buf).is_err());
    }

    #[test]
    fn test_missing_content_length_means_empty_body() {
        let mut buf = ByteBuffer::new();
        buf.append(b"HTTP/1.1 200 OK\r\n\r\n");

        let mut parser = HttpResponseParser::new();
        assert_eq!(parser.advance(&mut buf).unwrap(), ParseStatus::Done);
        assert_eq!(parser.take_body().unwrap(), "");
    }
}
