//! HTTP message parsing
//!
//! Incremental parsers for HTTP/1.1 requests and responses. The request
//! parser aggregates full bodies (Content-Length or chunked) up to a
//! configured limit and persists across requests on a connection, so
//! pipelined requests parse out of the same buffer in arrival order.

use super::chunked::ChunkedDecoder;
use super::{Error, Headers, HttpRequest, HttpResponse, Method, Result, Status, Version};
use std::net::IpAddr;

/// Room allowed for the request line and headers on top of the body limit
const HEADER_SLACK: usize = 16 * 1024;

/// Find the next CRLF in a buffer
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parse HTTP request line
///
/// Format: METHOD URI VERSION\r\n
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() != 3 {
        return Err(Error::Parse(format!(
            "Invalid request line: expected 3 parts, got {}",
            parts.len()
        )));
    }

    let method = Method::from_str(parts[0])?;
    let uri = parts[1].to_string();
    let version = Version::from_str(parts[2])?;

    Ok((method, uri, version))
}

/// Parse HTTP response status line
///
/// Format: VERSION STATUS REASON\r\n
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let parts: Vec<&str> = line.splitn(3, ' ').collect();

    if parts.len() < 2 {
        return Err(Error::Parse(format!(
            "Invalid status line: expected at least 2 parts, got {}",
            parts.len()
        )));
    }

    let version = Version::from_str(parts[0])?;
    let status_code = parts[1]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("Invalid status code: {}", parts[1])))?;
    let status = Status::new(status_code)?;
    let reason = if parts.len() == 3 {
        parts[2].to_string()
    } else {
        status.reason_phrase().to_string()
    };

    Ok((version, status, reason))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    RequestLine,
    Headers,
    Body,
    ChunkedBody,
}

/// Incremental HTTP request parser with bounded body aggregation
pub struct RequestParser {
    state: ParserState,
    buffer: Vec<u8>,
    max_content_length: usize,
    remote_addr: Option<IpAddr>,
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    content_length: usize,
    chunk_decoder: ChunkedDecoder,
    chunk_body: Vec<u8>,
}

impl RequestParser {
    /// Create a new request parser with a body aggregation limit
    pub fn new(max_content_length: usize) -> Self {
        RequestParser {
            state: ParserState::RequestLine,
            buffer: Vec::new(),
            max_content_length,
            remote_addr: None,
            method: None,
            uri: None,
            version: None,
            headers: Headers::new(),
            content_length: 0,
            chunk_decoder: ChunkedDecoder::new(),
            chunk_body: Vec::new(),
        }
    }

    /// Record the peer address that produced requests will carry
    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Whether unparsed bytes remain buffered (pipelined request data)
    pub fn has_buffered(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Take the unparsed leftover bytes
    ///
    /// Used when an h2c upgrade retires the parser: anything the client
    /// sent after the upgrade request belongs to the HTTP/2 framing layer.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(request)) when a complete request is parsed (the
    /// parser is then ready for the next request on the same connection),
    /// Ok(None) if more data is needed, or Err on parse error or an
    /// over-limit body.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpRequest>> {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > self.max_content_length + HEADER_SLACK {
            return Err(Error::PayloadTooLarge(self.max_content_length));
        }

        loop {
            match self.state {
                ParserState::RequestLine => {
                    if !self.take_request_line()? {
                        return Ok(None);
                    }
                }
                ParserState::Headers => {
                    if !self.take_headers()? {
                        return Ok(None);
                    }
                }
                ParserState::Body => {
                    if self.buffer.len() >= self.content_length {
                        let body: Vec<u8> = self.buffer.drain(..self.content_length).collect();
                        return Ok(Some(self.finish_request(body)));
                    }
                    return Ok(None);
                }
                ParserState::ChunkedBody => {
                    let buffer = std::mem::take(&mut self.buffer);
                    let (consumed, complete) =
                        match self.chunk_decoder.decode(&buffer, &mut self.chunk_body) {
                            Ok(r) => r,
                            Err(e) => {
                                self.buffer = buffer;
                                return Err(e);
                            }
                        };
                    self.buffer = buffer;
                    self.buffer.drain(..consumed);

                    if self.chunk_body.len() > self.max_content_length {
                        return Err(Error::PayloadTooLarge(self.max_content_length));
                    }
                    if complete {
                        let body = std::mem::take(&mut self.chunk_body);
                        return Ok(Some(self.finish_request(body)));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn take_request_line(&mut self) -> Result<bool> {
        if let Some(crlf_pos) = find_crlf(&self.buffer) {
            let line = String::from_utf8_lossy(&self.buffer[..crlf_pos]).to_string();
            self.buffer.drain(..crlf_pos + 2);

            let (method, uri, version) = parse_request_line(&line)?;
            self.method = Some(method);
            self.uri = Some(uri);
            self.version = Some(version);

            self.state = ParserState::Headers;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn take_headers(&mut self) -> Result<bool> {
        loop {
            let Some(crlf_pos) = find_crlf(&self.buffer) else {
                return Ok(false);
            };

            if crlf_pos == 0 {
                // Empty line marks end of headers
                self.buffer.drain(..2);
                return self.enter_body_state().map(|_| true);
            }

            let line = String::from_utf8_lossy(&self.buffer[..crlf_pos]).to_string();
            self.buffer.drain(..crlf_pos + 2);

            let (name, value) = Headers::parse_header_line(&line)?;
            self.headers.insert(name, value);
        }
    }

    fn enter_body_state(&mut self) -> Result<()> {
        if self.headers.contains_token("Transfer-Encoding", "chunked") {
            self.chunk_decoder = ChunkedDecoder::new();
            self.chunk_body = Vec::new();
            self.state = ParserState::ChunkedBody;
            return Ok(());
        }

        self.content_length = match self.headers.get("Content-Length") {
            Some(cl_str) => cl_str
                .parse::<usize>()
                .map_err(|_| Error::Parse(format!("Invalid Content-Length: {}", cl_str)))?,
            None => 0,
        };

        // Reject a declared over-limit body before buffering any of it
        if self.content_length > self.max_content_length {
            return Err(Error::PayloadTooLarge(self.max_content_length));
        }

        self.state = ParserState::Body;
        Ok(())
    }

    fn finish_request(&mut self, body: Vec<u8>) -> HttpRequest {
        let mut builder = HttpRequest::builder()
            .method(self.method.take().unwrap_or(Method::Get))
            .uri(self.uri.take().unwrap_or_else(|| "/".to_string()))
            .version(self.version.take().unwrap_or_default())
            .headers(std::mem::take(&mut self.headers))
            .body(body);

        if let Some(addr) = self.remote_addr {
            builder = builder.remote_addr(addr);
        }

        // Ready for the next pipelined request; leftover bytes stay buffered
        self.state = ParserState::RequestLine;
        self.content_length = 0;

        builder.build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ResponseState {
    StatusLine,
    Headers,
    Body,
}

/// Incremental HTTP response parser
///
/// Used by the integration tests to read what the server writes back.
pub struct ResponseParser {
    state: ResponseState,
    buffer: Vec<u8>,
    version: Option<Version>,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    content_length: usize,
}

impl ResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        ResponseParser {
            state: ResponseState::StatusLine,
            buffer: Vec::new(),
            version: None,
            status: None,
            reason: None,
            headers: Headers::new(),
            content_length: 0,
        }
    }

    /// Feed data to the parser
    ///
    /// Returns Ok(Some(response)) when a complete response is parsed; the
    /// parser then resets for the next response, keeping leftover bytes.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<HttpResponse>> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.state {
                ResponseState::StatusLine => {
                    let Some(crlf_pos) = find_crlf(&self.buffer) else {
                        return Ok(None);
                    };
                    let line = String::from_utf8_lossy(&self.buffer[..crlf_pos]).to_string();
                    self.buffer.drain(..crlf_pos + 2);

                    let (version, status, reason) = parse_status_line(&line)?;
                    self.version = Some(version);
                    self.status = Some(status);
                    self.reason = Some(reason);
                    self.state = ResponseState::Headers;
                }
                ResponseState::Headers => {
                    let Some(crlf_pos) = find_crlf(&self.buffer) else {
                        return Ok(None);
                    };
                    if crlf_pos == 0 {
                        self.buffer.drain(..2);
                        self.content_length = match self.headers.get("Content-Length") {
                            Some(cl) => cl.parse::<usize>().map_err(|_| {
                                Error::Parse(format!("Invalid Content-Length: {}", cl))
                            })?,
                            None => 0,
                        };
                        self.state = ResponseState::Body;
                        continue;
                    }
                    let line = String::from_utf8_lossy(&self.buffer[..crlf_pos]).to_string();
                    self.buffer.drain(..crlf_pos + 2);

                    let (name, value) = Headers::parse_header_line(&line)?;
                    self.headers.insert(name, value);
                }
                ResponseState::Body => {
                    if self.buffer.len() < self.content_length {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..self.content_length).collect();

                    let mut response =
                        HttpResponse::new(self.status.take().unwrap_or(Status::OK));
                    *response.headers_mut() = std::mem::take(&mut self.headers);
                    response.set_body(body);

                    self.state = ResponseState::StatusLine;
                    self.version = None;
                    self.reason = None;
                    self.content_length = 0;

                    return Ok(Some(response));
                }
            }
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line() {
        let (method, uri, version) = parse_request_line("GET /index.html HTTP/1.1").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(uri, "/index.html");
        assert_eq!(version, Version::Http11);
    }

    #[test]
    fn test_parse_status_line() {
        let (version, status, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::Http11);
        assert_eq!(status.code(), 200);
        assert_eq!(reason, "OK");

        let (_, status, reason) = parse_status_line("HTTP/1.0 404").unwrap();
        assert_eq!(status.code(), 404);
        assert_eq!(reason, "Not Found");
    }

    #[test]
    fn test_request_simple() {
        let mut parser = RequestParser::new(1024);
        let req = parser
            .parse(b"GET /test HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap()
            .unwrap();

        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.uri(), "/test");
        assert_eq!(req.headers().get("Host"), Some("localhost"));
        assert!(req.body().is_empty());
    }

    #[test]
    fn test_request_with_body() {
        let mut parser = RequestParser::new(1024);
        let req = parser
            .parse(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nHello")
            .unwrap()
            .unwrap();

        assert_eq!(req.method(), Method::Post);
        assert_eq!(req.body(), b"Hello");
    }

    #[test]
    fn test_request_incremental() {
        let mut parser = RequestParser::new(1024);
        assert!(parser.parse(b"POST / HT").unwrap().is_none());
        assert!(parser.parse(b"TP/1.1\r\nContent-Le").unwrap().is_none());
        assert!(parser.parse(b"ngth: 4\r\n\r\nTe").unwrap().is_none());
        let req = parser.parse(b"st").unwrap().unwrap();
        assert_eq!(req.body(), b"Test");
    }

    #[test]
    fn test_request_pipelined() {
        let mut parser = RequestParser::new(1024);
        let wire = b"POST /a HTTP/1.1\r\nContent-Length: 1\r\n\r\nAPOST /b HTTP/1.1\r\nContent-Length: 1\r\n\r\nB";

        let first = parser.parse(wire).unwrap().unwrap();
        assert_eq!(first.uri(), "/a");
        assert_eq!(first.body(), b"A");
        assert!(parser.has_buffered());

        let second = parser.parse(&[]).unwrap().unwrap();
        assert_eq!(second.uri(), "/b");
        assert_eq!(second.body(), b"B");
        assert!(!parser.has_buffered());
    }

    #[test]
    fn test_request_chunked_body() {
        let mut parser = RequestParser::new(1024);
        let req = parser
            .parse(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
            )
            .unwrap()
            .unwrap();
        assert_eq!(req.body(), b"Hello World");
    }

    #[test]
    fn test_declared_length_over_limit() {
        let mut parser = RequestParser::new(16);
        let err = parser
            .parse(b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(16)));
    }

    #[test]
    fn test_chunked_body_over_limit() {
        let mut parser = RequestParser::new(4);
        let err = parser
            .parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n")
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(4)));
    }

    #[test]
    fn test_remote_addr_attached() {
        let mut parser =
            RequestParser::new(1024).with_remote_addr("127.0.0.1".parse().unwrap());
        let req = parser.parse(b"GET / HTTP/1.1\r\n\r\n").unwrap().unwrap();
        assert_eq!(req.remote_addr().unwrap().to_string(), "127.0.0.1");
    }

    #[test]
    fn test_response_parser_simple() {
        let mut parser = ResponseParser::new();
        let resp = parser
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nHello")
            .unwrap()
            .unwrap();

        assert_eq!(resp.status().code(), 200);
        assert_eq!(resp.body(), b"Hello");
    }

    #[test]
    fn test_response_parser_back_to_back() {
        let mut parser = ResponseParser::new();
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nAHTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nB";

        let first = parser.parse(wire).unwrap().unwrap();
        assert_eq!(first.body(), b"A");
        let second = parser.parse(&[]).unwrap().unwrap();
        assert_eq!(second.body(), b"B");
    }
}
