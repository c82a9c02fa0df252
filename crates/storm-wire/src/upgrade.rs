//! HTTP/1.1 upgrade handling for the WebSocket handshake (RFC 6455
//! Section 4).
//!
//! The server side parses and validates the upgrade request and builds the
//! `101 Switching Protocols` (or an error/reject) response; the client side
//! builds the upgrade request and validates the server's response,
//! including the `Sec-WebSocket-Accept` check.
//!
//! Both parsers work on an accumulation buffer and return `Ok(None)` until
//! the terminating `\r\n\r\n` has arrived; on success the request or
//! response bytes are consumed from the buffer and any pipelined bytes
//! (for example the first WebSocket frame) are left behind.

use std::collections::HashMap;
use std::fmt;

use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};

/// RFC 6455 GUID appended to the client key before hashing.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Terminator separating the HTTP head from the body/stream.
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
///
/// `base64(SHA1(key || GUID))`; the result is always 28 ASCII characters.
///
/// ```
/// use storm_wire::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Errors from parsing or validating the upgrade exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeError {
    /// Request or status line could not be parsed.
    MalformedRequest(String),
    /// `Upgrade: websocket` header missing or wrong.
    MissingUpgradeHeader,
    /// `Connection` header missing or lacking the `Upgrade` token.
    MissingConnectionHeader,
    /// `Sec-WebSocket-Version` is not `13`.
    InvalidVersion,
    /// `Sec-WebSocket-Key` header missing.
    MissingKey,
    /// `Origin` missing or not in the allowed list.
    ForbiddenOrigin,
    /// Client URL could not be parsed.
    InvalidUrl(String),
    /// Server answered with a status other than 101.
    NotSwitchingProtocols(u16),
    /// Server's `Sec-WebSocket-Accept` does not match the key sent.
    AcceptMismatch {
        /// Accept value computed from the key we sent.
        expected: String,
        /// Accept value the server returned (empty if absent).
        actual: String,
    },
}

impl fmt::Display for UpgradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedRequest(msg) => write!(f, "malformed HTTP request: {msg}"),
            Self::MissingUpgradeHeader => write!(f, "missing or invalid Upgrade header"),
            Self::MissingConnectionHeader => {
                write!(f, "Connection header does not include the Upgrade token")
            }
            Self::InvalidVersion => write!(f, "unsupported Sec-WebSocket-Version"),
            Self::MissingKey => write!(f, "missing Sec-WebSocket-Key header"),
            Self::ForbiddenOrigin => write!(f, "origin not allowed"),
            Self::InvalidUrl(msg) => write!(f, "invalid WebSocket URL: {msg}"),
            Self::NotSwitchingProtocols(status) => {
                write!(f, "expected 101 Switching Protocols, got {status}")
            }
            Self::AcceptMismatch { expected, actual } => {
                write!(
                    f,
                    "Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for UpgradeError {}

impl From<UpgradeError> for std::io::Error {
    fn from(err: UpgradeError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, err)
    }
}

fn find_head_end(src: &[u8]) -> Option<usize> {
    src.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    headers
}

/// Parsed WebSocket upgrade request.
///
/// Header names are stored lowercased, so [`UpgradeRequest::header`] is
/// case-insensitive.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// HTTP method (must be GET for an upgrade).
    pub method: String,
    /// Request path without the query string.
    pub path: String,
    /// Raw query string, if any.
    pub query_string: Option<String>,
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Try to parse a complete request head from the front of `src`.
    ///
    /// `Ok(None)` until `\r\n\r\n` has arrived. On success the head is
    /// consumed from `src`.
    pub fn parse(src: &mut BytesMut) -> Result<Option<Self>, UpgradeError> {
        let Some(head_end) = find_head_end(src) else {
            return Ok(None);
        };

        let head = src.split_to(head_end);
        let text = std::str::from_utf8(&head)
            .map_err(|_| UpgradeError::MalformedRequest("request head is not UTF-8".into()))?;

        let mut lines = text.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| UpgradeError::MalformedRequest("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| UpgradeError::MalformedRequest("missing method".into()))?
            .to_string();
        let target = parts
            .next()
            .ok_or_else(|| UpgradeError::MalformedRequest("missing request target".into()))?;
        parts
            .next()
            .ok_or_else(|| UpgradeError::MalformedRequest("missing HTTP version".into()))?;

        let (path, query_string) = match target.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (target.to_string(), None),
        };

        Ok(Some(Self {
            method,
            path,
            query_string,
            headers: parse_headers(lines),
        }))
    }

    /// Look up a header value, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// All headers with lowercased names.
    #[must_use]
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Query string split into key/value pairs (`flag` style entries map to
    /// an empty value).
    #[must_use]
    pub fn query(&self) -> HashMap<String, String> {
        let mut query = HashMap::new();
        if let Some(qs) = &self.query_string {
            for pair in qs.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => query.insert(k.to_string(), v.to_string()),
                    None => query.insert(pair.to_string(), String::new()),
                };
            }
        }
        query
    }

    /// The client's `Sec-WebSocket-Key`, once validated present.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
    }

    /// Validate the request per RFC 6455 Section 4.2.1.
    ///
    /// `allowed_origins` is the server's allow-list: when non-empty, the
    /// `Origin` header must match one entry (case-insensitive, full-string
    /// compare); a missing `Origin` is then forbidden as well.
    pub fn validate(&self, allowed_origins: &[String]) -> Result<(), UpgradeError> {
        if !self.method.eq_ignore_ascii_case("GET") {
            return Err(UpgradeError::MalformedRequest(format!(
                "upgrade method must be GET, got {}",
                self.method
            )));
        }

        match self.header("upgrade") {
            Some(value) if value.eq_ignore_ascii_case("websocket") => {}
            _ => return Err(UpgradeError::MissingUpgradeHeader),
        }

        // `Connection` is a comma-separated token list; `keep-alive,
        // Upgrade` must pass.
        let has_upgrade_token = self
            .header("connection")
            .map(|value| {
                value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        if !has_upgrade_token {
            return Err(UpgradeError::MissingConnectionHeader);
        }

        match self.header("sec-websocket-version") {
            Some("13") => {}
            _ => return Err(UpgradeError::InvalidVersion),
        }

        if self.key().is_none() {
            return Err(UpgradeError::MissingKey);
        }

        if !allowed_origins.is_empty() {
            let allowed = self
                .header("origin")
                .map(|origin| {
                    allowed_origins
                        .iter()
                        .any(|entry| entry.eq_ignore_ascii_case(origin))
                })
                .unwrap_or(false);
            if !allowed {
                return Err(UpgradeError::ForbiddenOrigin);
            }
        }

        Ok(())
    }
}

/// Build the `101 Switching Protocols` response for a validated request.
#[must_use]
pub fn build_accept_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
    .into_bytes()
}

/// Build the HTTP error response for a failed validation.
///
/// Most failures answer `400 Bad Request` with the error text as body;
/// a version mismatch advertises the supported version and a forbidden
/// origin answers `403`.
#[must_use]
pub fn build_error_response(error: &UpgradeError) -> Vec<u8> {
    match error {
        UpgradeError::ForbiddenOrigin => build_reject_response(403, "Origin not allowed"),
        UpgradeError::InvalidVersion => {
            let body = error.to_string();
            format!(
                "HTTP/1.1 400 Bad Request\r\n\
                 Sec-WebSocket-Version: 13\r\n\
                 Connection: close\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {body}",
                body.len()
            )
            .into_bytes()
        }
        other => {
            let body = other.to_string();
            format!(
                "HTTP/1.1 400 Bad Request\r\n\
                 Connection: close\r\n\
                 Content-Type: text/plain\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {body}",
                body.len()
            )
            .into_bytes()
        }
    }
}

/// Build an arbitrary rejection response (401, 403, 404, 429, ...).
#[must_use]
pub fn build_reject_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {phrase}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {len}\r\n\
         \r\n\
         {reason}",
        phrase = reason_phrase(status),
        len = reason.len(),
    )
    .into_bytes()
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 => "Request Timeout",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Parsed `ws://` / `wss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUrl {
    /// Host name or IP literal (brackets stripped for IPv6).
    pub host: String,
    /// Port, defaulted from the scheme when absent.
    pub port: u16,
    /// Path including the query string; defaults to `/`.
    pub path_and_query: String,
    /// Whether the scheme requires TLS (`wss`).
    pub tls: bool,
}

impl WsUrl {
    /// Parse a WebSocket URL.
    pub fn parse(url: &str) -> Result<Self, UpgradeError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| UpgradeError::InvalidUrl("missing scheme".into()))?;

        let tls = match scheme {
            "ws" => false,
            "wss" => true,
            other => {
                return Err(UpgradeError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )))
            }
        };
        let default_port = if tls { 443 } else { 80 };

        let (host_port, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = if let Some(bracket_end) = host_port.find(']') {
            // IPv6 literal: [::1]:9000
            if !host_port.starts_with('[') {
                return Err(UpgradeError::InvalidUrl("malformed IPv6 literal".into()));
            }
            let host = host_port[1..bracket_end].to_string();
            let port = match host_port[bracket_end + 1..].strip_prefix(':') {
                Some(port) => port
                    .parse()
                    .map_err(|_| UpgradeError::InvalidUrl("invalid port".into()))?,
                None => default_port,
            };
            (host, port)
        } else if let Some((host, port)) = host_port.rsplit_once(':') {
            let port = port
                .parse()
                .map_err(|_| UpgradeError::InvalidUrl("invalid port".into()))?;
            (host.to_string(), port)
        } else {
            (host_port.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(UpgradeError::InvalidUrl("empty host".into()));
        }

        Ok(Self {
            host,
            port,
            path_and_query,
            tls,
        })
    }

    /// `Host` header value: the port is elided when it matches the
    /// scheme's default (80 for `ws`, 443 for `wss`).
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// Client side of the upgrade: request construction and response
/// validation for one connection attempt.
#[derive(Debug, Clone)]
pub struct ClientUpgrade {
    url: WsUrl,
    key: String,
    extra_headers: Vec<(String, String)>,
}

impl ClientUpgrade {
    /// Create an upgrade for the given URL with a fresh random nonce.
    #[must_use]
    pub fn new(url: WsUrl) -> Self {
        Self {
            url,
            key: generate_nonce(),
            extra_headers: Vec::new(),
        }
    }

    /// Append extra request headers (for example authorization tokens).
    #[must_use]
    pub fn extra_headers(
        mut self,
        headers: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        self.extra_headers.extend(headers);
        self
    }

    /// The target URL.
    #[must_use]
    pub fn url(&self) -> &WsUrl {
        &self.url
    }

    /// The base64 nonce sent as `Sec-WebSocket-Key`.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serialize the upgrade request.
    #[must_use]
    pub fn request_bytes(&self) -> Vec<u8> {
        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            self.url.path_and_query,
            self.url.host_header(),
            self.key,
        );
        for (name, value) in &self.extra_headers {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
        request.push_str("\r\n");
        request.into_bytes()
    }

    /// Validate the server's response against the key we sent.
    pub fn validate_response(&self, response: &UpgradeResponse) -> Result<(), UpgradeError> {
        if response.status != 101 {
            return Err(UpgradeError::NotSwitchingProtocols(response.status));
        }
        let expected = compute_accept_key(&self.key);
        let actual = response.header("sec-websocket-accept").unwrap_or_default();
        if actual != expected {
            return Err(UpgradeError::AcceptMismatch {
                expected,
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// Fresh 16-byte nonce, base64-encoded, from the system CSPRNG.
fn generate_nonce() -> String {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).expect("system entropy source unavailable");
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Parsed HTTP response head for the client side of the handshake.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    /// HTTP status code.
    pub status: u16,
    /// Status reason phrase.
    pub reason: String,
    headers: HashMap<String, String>,
}

impl UpgradeResponse {
    /// Try to parse a complete response head from the front of `src`.
    ///
    /// `Ok(None)` until `\r\n\r\n` has arrived; on success the head is
    /// consumed from `src`, leaving any pipelined frame bytes behind.
    pub fn parse(src: &mut BytesMut) -> Result<Option<Self>, UpgradeError> {
        let Some(head_end) = find_head_end(src) else {
            return Ok(None);
        };

        let head = src.split_to(head_end);
        let text = std::str::from_utf8(&head)
            .map_err(|_| UpgradeError::MalformedRequest("response head is not UTF-8".into()))?;

        let mut lines = text.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| UpgradeError::MalformedRequest("empty response".into()))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| UpgradeError::MalformedRequest("missing HTTP version".into()))?;
        if !version.starts_with("HTTP/1.1") {
            return Err(UpgradeError::MalformedRequest(format!(
                "unexpected HTTP version: {version}"
            )));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| UpgradeError::MalformedRequest("invalid status code".into()))?;
        let reason = parts.next().unwrap_or("").to_string();

        Ok(Some(Self {
            status,
            reason,
            headers: parse_headers(lines),
        }))
    }

    /// Look up a header value, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &[u8] = b"GET /chat?room=storm&token=abc HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: https://example.com\r\n\
        \r\n";

    fn parse_request(raw: &[u8]) -> UpgradeRequest {
        let mut buf = BytesMut::from(raw);
        UpgradeRequest::parse(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(accept.len(), 28);
    }

    #[test]
    fn parse_is_incomplete_without_terminator() {
        let mut buf = BytesMut::from(&SAMPLE_REQUEST[..SAMPLE_REQUEST.len() - 2]);
        assert!(UpgradeRequest::parse(&mut buf).unwrap().is_none());
        // Buffer untouched while incomplete.
        assert_eq!(buf.len(), SAMPLE_REQUEST.len() - 2);
    }

    #[test]
    fn parse_consumes_head_and_leaves_pipelined_bytes() {
        let mut raw = SAMPLE_REQUEST.to_vec();
        raw.extend_from_slice(&[0x81, 0x00]); // pipelined frame header
        let mut buf = BytesMut::from(&raw[..]);

        let request = UpgradeRequest::parse(&mut buf).unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/chat");
        assert_eq!(request.query_string.as_deref(), Some("room=storm&token=abc"));
        assert_eq!(&buf[..], &[0x81, 0x00]);
    }

    #[test]
    fn query_map_splits_pairs() {
        let request = parse_request(SAMPLE_REQUEST);
        let query = request.query();
        assert_eq!(query.get("room").map(String::as_str), Some("storm"));
        assert_eq!(query.get("token").map(String::as_str), Some("abc"));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let request = parse_request(SAMPLE_REQUEST);
        assert_eq!(request.header("HOST"), Some("example.com"));
        assert_eq!(request.header("sec-websocket-key").unwrap().len(), 24);
    }

    #[test]
    fn validate_accepts_well_formed_request() {
        let request = parse_request(SAMPLE_REQUEST);
        request.validate(&[]).unwrap();
    }

    #[test]
    fn validate_accepts_connection_token_list() {
        let raw = b"GET / HTTP/1.1\r\n\
            Host: example.com\r\n\
            Upgrade: WebSocket\r\n\
            Connection: keep-alive, Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            \r\n";
        parse_request(raw).validate(&[]).unwrap();
    }

    #[test]
    fn validate_rejects_missing_headers() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(
            parse_request(raw).validate(&[]),
            Err(UpgradeError::MissingUpgradeHeader)
        );

        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: keep-alive\r\n\r\n";
        assert_eq!(
            parse_request(raw).validate(&[]),
            Err(UpgradeError::MissingConnectionHeader)
        );

        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Version: 8\r\n\r\n";
        assert_eq!(
            parse_request(raw).validate(&[]),
            Err(UpgradeError::InvalidVersion)
        );

        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        assert_eq!(
            parse_request(raw).validate(&[]),
            Err(UpgradeError::MissingKey)
        );
    }

    #[test]
    fn origin_check_is_case_insensitive_full_compare() {
        let request = parse_request(SAMPLE_REQUEST);
        let allowed = vec!["HTTPS://EXAMPLE.COM".to_string()];
        request.validate(&allowed).unwrap();

        // Prefix match is not enough.
        let allowed = vec!["https://example.com/app".to_string()];
        assert_eq!(
            request.validate(&allowed),
            Err(UpgradeError::ForbiddenOrigin)
        );
    }

    #[test]
    fn missing_origin_with_allow_list_is_forbidden() {
        let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\r\n";
        let request = parse_request(raw);
        request.validate(&[]).unwrap();
        assert_eq!(
            request.validate(&["https://example.com".to_string()]),
            Err(UpgradeError::ForbiddenOrigin)
        );
    }

    #[test]
    fn accept_response_contains_required_headers() {
        let response = build_accept_response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_responses_use_mapped_statuses() {
        let text =
            String::from_utf8(build_error_response(&UpgradeError::InvalidVersion)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));

        let text =
            String::from_utf8(build_error_response(&UpgradeError::ForbiddenOrigin)).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.ends_with("Origin not allowed"));

        let text =
            String::from_utf8(build_error_response(&UpgradeError::MissingKey)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn reject_response_carries_status_and_reason() {
        let text = String::from_utf8(build_reject_response(429, "slow down")).unwrap();
        assert!(text.starts_with("HTTP/1.1 429 Too Many Requests\r\n"));
        assert!(text.ends_with("slow down"));
    }

    #[test]
    fn ws_url_parse_variants() {
        let url = WsUrl::parse("ws://example.com/chat?x=1").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path_and_query, "/chat?x=1");
        assert!(!url.tls);

        let url = WsUrl::parse("wss://example.com:8443").unwrap();
        assert_eq!(url.port, 8443);
        assert_eq!(url.path_and_query, "/");
        assert!(url.tls);

        let url = WsUrl::parse("ws://[::1]:9000/ws").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 9000);

        assert!(WsUrl::parse("http://example.com").is_err());
        assert!(WsUrl::parse("no-scheme").is_err());
    }

    #[test]
    fn host_header_elides_default_ports() {
        assert_eq!(
            WsUrl::parse("ws://example.com/x").unwrap().host_header(),
            "example.com"
        );
        assert_eq!(
            WsUrl::parse("wss://example.com:443/x").unwrap().host_header(),
            "example.com"
        );
        assert_eq!(
            WsUrl::parse("ws://example.com:9000/x").unwrap().host_header(),
            "example.com:9000"
        );
        assert_eq!(
            WsUrl::parse("ws://[::1]:9000/x").unwrap().host_header(),
            "[::1]:9000"
        );
    }

    #[test]
    fn client_request_contains_required_headers() {
        let upgrade = ClientUpgrade::new(WsUrl::parse("ws://example.com:9000/chat?a=b").unwrap())
            .extra_headers([("Authorization".to_string(), "Bearer t".to_string())]);
        let text = String::from_utf8(upgrade.request_bytes()).unwrap();

        assert!(text.starts_with("GET /chat?a=b HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:9000\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains(&format!("Sec-WebSocket-Key: {}\r\n", upgrade.key())));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Authorization: Bearer t\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn client_nonce_is_16_random_bytes() {
        let upgrade = ClientUpgrade::new(WsUrl::parse("ws://h/").unwrap());
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(upgrade.key())
            .unwrap();
        assert_eq!(decoded.len(), 16);
    }

    #[test]
    fn client_validates_server_response() {
        let upgrade = ClientUpgrade::new(WsUrl::parse("ws://example.com/").unwrap());
        let accept = compute_accept_key(upgrade.key());

        let mut buf = BytesMut::from(
            format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\
                 \r\n"
            )
            .as_bytes(),
        );
        let response = UpgradeResponse::parse(&mut buf).unwrap().unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(response.reason, "Switching Protocols");
        upgrade.validate_response(&response).unwrap();
    }

    #[test]
    fn client_rejects_bad_status_and_bad_accept() {
        let upgrade = ClientUpgrade::new(WsUrl::parse("ws://example.com/").unwrap());

        let mut buf = BytesMut::from(&b"HTTP/1.1 403 Forbidden\r\n\r\n"[..]);
        let response = UpgradeResponse::parse(&mut buf).unwrap().unwrap();
        assert_eq!(
            upgrade.validate_response(&response),
            Err(UpgradeError::NotSwitchingProtocols(403))
        );

        let mut buf = BytesMut::from(
            &b"HTTP/1.1 101 Switching Protocols\r\n\
               Sec-WebSocket-Accept: bogus\r\n\r\n"[..],
        );
        let response = UpgradeResponse::parse(&mut buf).unwrap().unwrap();
        assert!(matches!(
            upgrade.validate_response(&response),
            Err(UpgradeError::AcceptMismatch { .. })
        ));
    }
}
