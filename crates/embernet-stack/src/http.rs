//! HTTP framing over TCP: request assembly and parsing, response assembly
//! and parsing, and the blocking client `send`. Responses stream their
//! body in fixed-size chunks so a large file never has to sit in memory
//! at once.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use embernet_packetlib::util::locate;

use crate::adapter::Adapter;
use crate::tcp::Connection;
use crate::StackError;

const HEADER_DELIMITER: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// An HTTP request: built locally for the client role, or parsed off a TCP
/// segment in the server role (in which case it carries the connection to
/// respond on).
pub struct HttpRequest {
    /// The verb: GET, POST, PUT, ...
    pub method: String,
    /// Percent-decoded resource path.
    pub path: String,
    pub protocol: String,
    pub host: String,
    pub headers: HashMap<String, String>,
    /// Request body; empty for GET.
    pub body: String,
    connection: Option<Connection>,
}

impl HttpRequest {
    /// A GET for `url` (`http://host/path` or just `host/path`).
    pub fn new(url: &str) -> Self {
        let url = url.strip_prefix("http://").unwrap_or(url);
        let (host, path) = match url.find('/') {
            Some(at) => (&url[..at], &url[at..]),
            None => (url, ""),
        };
        let path = url_encode(path.trim(), false);
        Self {
            method: "GET".into(),
            path: if path.is_empty() { "/".into() } else { path },
            protocol: "HTTP/1.1".into(),
            host: host.trim().to_string(),
            headers: HashMap::new(),
            body: String::new(),
            connection: None,
        }
    }

    /// A POST carrying `body`, with `Content-Length` filled in.
    pub fn with_body(url: &str, body: &str) -> Self {
        let mut request = Self::new(url);
        if !body.is_empty() {
            request.method = "POST".into();
            request
                .headers
                .insert("Content-Length".into(), body.len().to_string());
            request.body = body.to_string();
        }
        request
    }

    /// Reuses an already open connection instead of resolving `host`.
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Parses an inbound request off the wire. Malformed *header lines*
    /// (non-printable bytes, no colon) are skipped so one bad header can't
    /// sink the rest; a missing request line or delimiter fails the parse.
    pub fn parse(payload: &[u8], connection: Connection) -> Result<Self, StackError> {
        let delimiter = locate(payload, HEADER_DELIMITER)
            .ok_or(StackError::MalformedHttp("missing header delimiter"))?;
        let first_line_end =
            locate(payload, CRLF).ok_or(StackError::MalformedHttp("missing request line"))?;
        if first_line_end < 12 {
            return Err(StackError::MalformedHttp("request line too short"));
        }
        let first_line = core::str::from_utf8(&payload[..first_line_end])
            .map_err(|_| StackError::MalformedHttp("request line is not UTF-8"))?;
        let mut parts = first_line.split_whitespace();
        let method = parts
            .next()
            .ok_or(StackError::MalformedHttp("missing verb"))?
            .to_ascii_uppercase();
        let raw_path = parts.next().ok_or(StackError::MalformedHttp("missing path"))?;
        let path = url_decode(raw_path.trim(), false);
        // Assume HTTP/1.1 when the protocol token is unreadable.
        let protocol = match parts.next() {
            Some(token) if token.starts_with("HTTP") => token.to_string(),
            _ => "HTTP/1.1".into(),
        };

        let mut headers = HashMap::new();
        parse_header_lines(payload, first_line_end, delimiter, &mut headers);

        let body = if method != "GET" && delimiter + HEADER_DELIMITER.len() < payload.len() {
            String::from_utf8_lossy(&payload[delimiter + HEADER_DELIMITER.len()..]).into_owned()
        } else {
            String::new()
        };
        let host = headers.get("Host").cloned().unwrap_or_default();

        Ok(Self {
            method,
            path,
            protocol,
            host,
            headers,
            body,
            connection: Some(connection),
        })
    }

    fn assemble(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} {}\r\nHost: {}\r\n",
            self.method, self.path, self.protocol, self.host
        );
        for (key, value) in &self.headers {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        if self.method == "POST" && !self.body.is_empty() {
            out.push_str(&self.body);
        }
        out.into_bytes()
    }

    fn ensure_connection(&mut self, adapter: &Arc<Adapter>) -> Result<Connection, StackError> {
        if let Some(connection) = &self.connection {
            return Ok(connection.clone());
        }
        let addr = adapter.dns_lookup(&self.host, 3)?;
        let connection = adapter.connect(addr, 80);
        self.connection = Some(connection.clone());
        Ok(connection)
    }

    /// Fires the request without waiting for a response.
    pub fn send_async(&mut self, adapter: &Arc<Adapter>) -> Result<(), StackError> {
        let connection = self.ensure_connection(adapter)?;
        connection.send(&self.assemble())
    }

    /// Sends the request and blocks for the response, up to `timeout_secs`.
    /// `Ok(None)` means the peer didn't answer in time; retry at your own
    /// discretion. `header_only` skips materializing the response body.
    ///
    /// Application threads only; never call from an event handler.
    pub fn send(
        &mut self,
        adapter: &Arc<Adapter>,
        timeout_secs: u64,
        header_only: bool,
    ) -> Result<Option<HttpResponse>, StackError> {
        let connection = self.ensure_connection(adapter)?;
        let request = self.assemble();

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        connection.set_packet_handler(move |event| {
            let _ = tx.send(event.content);
        });

        if let Err(err) = connection.send(&request) {
            connection.clear_packet_handler();
            return Err(err);
        }
        let outcome = rx.recv_timeout(Duration::from_secs(timeout_secs));
        connection.clear_packet_handler();

        Ok(outcome
            .ok()
            .map(|content| HttpResponse::parse(&content, header_only)))
    }

    /// Streams `response` back on this request's connection: the header
    /// block first, then the body in `chunk_size` pieces, each handed to
    /// the driver before the next is read. The connection accepts the next
    /// request only once the stream is done.
    pub fn send_response(
        &self,
        response: HttpResponse,
        chunk_size: usize,
    ) -> Result<(), StackError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(StackError::NotReady("no connection to respond on"))?;
        let outcome = stream_response(connection, response, chunk_size);
        connection.mark_ready_for_request();
        outcome
    }

    /// Canned 404.
    pub fn send_not_found(&self) -> Result<(), StackError> {
        let body =
            "<html><head><title>Page Not Found</title></head><body>404 - Not Found</body></html>";
        self.send_response(
            HttpResponse::with_status(body, "text/html", "404 Not Found"),
            512,
        )
    }
}

fn stream_response(
    connection: &Connection,
    mut response: HttpResponse,
    chunk_size: usize,
) -> Result<(), StackError> {
    connection.send(&response.header_section())?;
    let Some(mut body) = response.body.take() else {
        return Ok(());
    };
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        let read = body.read(&mut chunk)?;
        if read == 0 {
            return Ok(());
        }
        connection.send(&chunk[..read])?;
    }
}

/// An HTTP response: built locally to answer a request, or parsed from the
/// wire as the result of a client `send`.
pub struct HttpResponse {
    /// Status line content. Locally built responses hold e.g. `200 OK`;
    /// parsed responses hold the full `HTTP/1.1 200 OK` line.
    pub status: String,
    pub content_type: Option<String>,
    /// The `Connection` header value; defaults to `close`.
    pub connection: Option<String>,
    pub headers: HashMap<String, String>,
    /// Parsed response body (client role); empty when `header_only`.
    pub message: String,
    body: Option<Box<dyn Read + Send>>,
    body_len: u64,
}

impl HttpResponse {
    /// A `200 OK` text/html response. Keep bodies built this way small;
    /// use [`HttpResponse::from_reader`] to stream anything big.
    pub fn new(body: &str) -> Self {
        Self::with_status(body, "text/html", "200 OK")
    }

    pub fn with_status(body: &str, content_type: &str, status: &str) -> Self {
        let bytes = body.as_bytes().to_vec();
        let body_len = bytes.len() as u64;
        Self {
            status: status.to_string(),
            content_type: Some(content_type.to_string()),
            connection: Some("close".into()),
            headers: HashMap::new(),
            message: String::new(),
            body: Some(Box::new(Cursor::new(bytes))),
            body_len,
        }
    }

    /// A response whose body is read on demand during the chunked send.
    /// `len` goes into `Content-Length`, so it must match what the reader
    /// will yield.
    pub fn from_reader(
        body: Box<dyn Read + Send>,
        len: u64,
        content_type: &str,
        status: &str,
    ) -> Self {
        Self {
            status: status.to_string(),
            content_type: Some(content_type.to_string()),
            connection: Some("close".into()),
            headers: HashMap::new(),
            message: String::new(),
            body: Some(body),
            body_len: len,
        }
    }

    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    /// Status line, headers, and the blank-line delimiter.
    pub fn header_section(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {}", self.status);
        if let Some(content_type) = self.content_type.as_ref().filter(|ct| !ct.is_empty()) {
            out.push_str("\r\nContent-Type: ");
            out.push_str(content_type);
        }
        for (key, value) in &self.headers {
            out.push_str("\r\n");
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
        }
        if self.body_len > 0 {
            out.push_str("\r\nContent-Length: ");
            out.push_str(&self.body_len.to_string());
        }
        if let Some(connection) = self.connection.as_ref().filter(|c| !c.is_empty()) {
            out.push_str("\r\nConnection: ");
            out.push_str(connection);
        }
        out.push_str("\r\n\r\n");
        out.into_bytes()
    }

    /// Parses a response off the wire. Deliberately lossy: whatever can be
    /// salvaged is, and a garbled response comes back mostly empty rather
    /// than as an error. `omit_body` skips the body to save memory when
    /// only the headers matter.
    pub fn parse(content: &[u8], omit_body: bool) -> Self {
        let delimiter = locate(content, HEADER_DELIMITER);
        let first_line_end = locate(content, CRLF).unwrap_or(content.len());
        let status = String::from_utf8_lossy(&content[..first_line_end]).into_owned();

        let mut headers = HashMap::new();
        let mut message = String::new();
        if let Some(delimiter) = delimiter {
            if delimiter > first_line_end + 2 && first_line_end > 5 {
                parse_header_lines(content, first_line_end + 2, delimiter, &mut headers);
            }
            if !omit_body && delimiter + HEADER_DELIMITER.len() < content.len() {
                message = String::from_utf8_lossy(&content[delimiter + HEADER_DELIMITER.len()..])
                    .into_owned();
            }
        }

        Self {
            status,
            content_type: None,
            connection: None,
            headers,
            message,
            body: None,
            body_len: 0,
        }
    }
}

/// Scans header lines byte-by-byte between `start` and `end` (the blank
/// line). A line is accepted when it has a colon past its first byte and
/// no bytes outside the printable range; anything else is skipped, not
/// fatal.
fn parse_header_lines(
    bytes: &[u8],
    start: usize,
    end: usize,
    headers: &mut HashMap<String, String>,
) {
    let mut colon: Option<usize> = None;
    let mut line_start = start;
    let mut malformed = false;
    let stop = end.min(bytes.len().saturating_sub(1));
    for i in start..=stop {
        let b = bytes[i];
        if b == b':' && colon.is_none() {
            colon = Some(i);
        }
        if !(0x09..=0x7e).contains(&b) {
            malformed = true;
        }
        if b == b'\r' || b == b'\n' {
            if let Some(colon_at) = colon {
                if colon_at > line_start && !malformed {
                    let key = String::from_utf8_lossy(&bytes[line_start..colon_at])
                        .trim()
                        .to_string();
                    let value = String::from_utf8_lossy(&bytes[colon_at + 1..i])
                        .trim()
                        .to_string();
                    if !key.is_empty() {
                        headers.insert(key, value);
                    }
                }
            }
            colon = None;
            line_start = i + 1;
            malformed = false;
        }
    }
}

/// Percent-encodes `input` for use in a URL path. Unreserved characters
/// (and `$ ( ) / \`, plus `.` unless `encode_period`) pass through; space
/// becomes `+`; everything else becomes `%XX`.
pub fn url_encode(input: &str, encode_period: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            ' ' => out.push('+'),
            '.' if !encode_period => out.push('.'),
            'A'..='Z' | 'a'..='z' | '0'..='9' => out.push(c),
            '$' | '(' | ')' | '/' | '\\' => out.push(c),
            other => {
                out.push_str(&format!("%{:02X}", other as u32));
            }
        }
    }
    out
}

/// Decodes `%XX` escapes (and `+` to space when `replace_plus`). Invalid
/// or truncated escapes pass through untouched instead of failing.
pub fn url_decode(input: &str, replace_plus: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(if replace_plus { ' ' } else { '+' });
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|pair| {
                    let hi = (pair[0] as char).to_digit(16)?;
                    let lo = (pair[1] as char).to_digit(16)?;
                    char::from_u32(hi * 16 + lo)
                });
                match hex {
                    Some(c) => {
                        out.push(c);
                        i += 3;
                    }
                    None => {
                        out.push('%');
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other as char);
                i += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_matches_decode() {
        assert_eq!(url_encode("/a file (1).txt", false), "/a+file+(1).txt");
        assert_eq!(url_decode("/a+file+(1).txt", true), "/a file (1).txt");
        assert_eq!(url_encode("/x?y=z", false), "/x%3Fy%3Dz");
        assert_eq!(url_decode("/x%3Fy%3Dz", false), "/x?y=z");
    }

    #[test]
    fn url_decode_tolerates_bad_escapes() {
        assert_eq!(url_decode("100%", true), "100%");
        assert_eq!(url_decode("a%zzb", true), "a%zzb");
    }

    #[test]
    fn request_assembles_post_with_content_length() {
        let request = HttpRequest::with_body("http://example.com/api", "{\"on\":true}");
        let bytes = request.assemble();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("POST /api HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"on\":true}"));
    }

    #[test]
    fn request_path_defaults_to_root() {
        let request = HttpRequest::new("example.com");
        assert_eq!(request.host, "example.com");
        assert_eq!(request.path, "/");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn response_header_section_shape() {
        let mut response = HttpResponse::new("hello");
        response.add_header("Cache-Control", "no-cache");
        let text = String::from_utf8(response.header_section()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Cache-Control: no-cache"));
        assert!(text.contains("Content-Length: 5"));
        assert!(text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_parse_salvages_headers_and_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nBad\x01Header: x\r\nServer: tiny\r\n\r\npayload";
        let response = HttpResponse::parse(wire, false);
        assert_eq!(response.status, "HTTP/1.1 200 OK");
        assert_eq!(response.headers.get("Content-Type").unwrap(), "text/plain");
        assert_eq!(response.headers.get("Server").unwrap(), "tiny");
        assert!(!response.headers.keys().any(|k| k.contains("Bad")));
        assert_eq!(response.message, "payload");
    }

    #[test]
    fn response_parse_can_omit_body() {
        let wire = b"HTTP/1.1 200 OK\r\nServer: tiny\r\n\r\nbig body";
        let response = HttpResponse::parse(wire, true);
        assert!(response.message.is_empty());
        assert_eq!(response.headers.get("Server").unwrap(), "tiny");
    }
}
