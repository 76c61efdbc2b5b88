//! Wire codec for HTTP messages tunneled over the gateway socket.
//!
//! The gateway speaks plain HTTP/1.1 inside websocket frames: requests go out
//! as raw request text, responses and pushed notifications come back as raw
//! response or request text, optionally chunked. Anything that does not start
//! with an HTTP start line is carried through as opaque binary.
//!
//! DESIGN
//! ======
//! - Kind detection only looks at the first line of a frame.
//! - [`MessageParser`] is incremental: bytes can be fed in any split and the
//!   message is returned once its framing (content-length or chunked) is
//!   satisfied. [`decode_message`] drives it for a single complete frame.
//! - Header names are case-folded; the last value seen for a name wins.
//! - Bodies declared `application/json` are parsed. A JSON-declared body that
//!   is really an HTML error page is reported as `{error: 1, body: <text>}`,
//!   and a literal `200` status on such a message is downgraded to `400`.
//! - [`Transport`] owns the relay byte-stuffing: frames to and from the remote
//!   relay carry one leading control byte, direct connections carry none.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Leading control byte on every frame exchanged through the remote relay.
pub const RELAY_CONTROL_BYTE: u8 = 0x02;

/// Header carrying the request/response correlation token.
pub const TRANSACTION_HEADER: &str = "transac-id";

/// Status forced onto a `200` message whose JSON body is an HTML error page.
pub const HTML_ERROR_STATUS: u16 = 400;

static REQUEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Z-]+) ([^ ]+) HTTP/(\d)\.(\d)$").expect("valid request line regex"));
static RESPONSE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^HTTP/(\d)\.(\d) (\d{3}) ?(.*)$").expect("valid response line regex"));

// =============================================================================
// ERRORS
// =============================================================================

/// Error returned while decoding a tunneled HTTP message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The header block is not valid UTF-8.
    #[error("header block is not valid UTF-8")]
    InvalidUtf8,
    /// The first line matches neither a request nor a response line.
    #[error("malformed start line: {0:?}")]
    StartLine(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0:?}")]
    HeaderLine(String),
    /// The `content-length` header is not a non-negative integer.
    #[error("invalid content-length: {0:?}")]
    ContentLength(String),
    /// A chunk size line is not valid hexadecimal.
    #[error("invalid chunk size: {0:?}")]
    ChunkSize(String),
    /// The frame ended before the message framing was satisfied.
    #[error("message ended before completion")]
    Incomplete,
    /// A body declared as JSON failed to parse.
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

// =============================================================================
// MESSAGE MODEL
// =============================================================================

/// Kind of a decoded wire unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Binary,
}

/// Request methods the client issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header map with case-insensitive names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value for the same name.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A decoded request or response.
///
/// Requests carry a method and no status; responses carry a status and no
/// method. Response uris come from the `uri-origin` header.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpMessage {
    pub kind: MessageKind,
    pub method: Option<String>,
    pub uri: String,
    pub status: Option<u16>,
    pub headers: Headers,
    pub body: Value,
    /// Milliseconds since the Unix epoch when the message was decoded.
    pub ts: i64,
}

impl HttpMessage {
    /// Correlation token echoed by the gateway, if any.
    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.headers.get(TRANSACTION_HEADER)
    }
}

/// One decoded unit from the socket.
#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolMessage {
    Http(HttpMessage),
    /// Opaque payload with no HTTP start line.
    Binary(Vec<u8>),
}

impl ProtocolMessage {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Http(message) => message.kind,
            Self::Binary(_) => MessageKind::Binary,
        }
    }
}

/// Undecorated message as produced by [`MessageParser`], before body casting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub status: Option<u16>,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl RawMessage {
    fn kind(&self) -> MessageKind {
        if self.status.is_some() { MessageKind::Response } else { MessageKind::Request }
    }
}

// =============================================================================
// DECODING
// =============================================================================

enum StartLine {
    Request { method: String, uri: String },
    Response { status: u16 },
}

fn first_line(data: &[u8]) -> &[u8] {
    find_crlf(data).map_or(data, |end| &data[..end])
}

fn parse_start_line(line: &[u8]) -> Option<StartLine> {
    let line = std::str::from_utf8(line).ok()?;
    if let Some(caps) = RESPONSE_LINE.captures(line) {
        let status = caps[3].parse().ok()?;
        return Some(StartLine::Response { status });
    }
    if let Some(caps) = REQUEST_LINE.captures(line) {
        return Some(StartLine::Request { method: caps[1].to_owned(), uri: caps[2].to_owned() });
    }
    None
}

/// Classify a frame from its first line.
#[must_use]
pub fn detect_kind(data: &[u8]) -> MessageKind {
    match parse_start_line(first_line(data)) {
        Some(StartLine::Response { .. }) => MessageKind::Response,
        Some(StartLine::Request { .. }) => MessageKind::Request,
        None => MessageKind::Binary,
    }
}

/// Decode one complete frame (already stripped of any relay byte).
///
/// # Errors
///
/// Returns a [`DecodeError`] when an HTTP frame is malformed, truncated, or
/// declares a JSON body that does not parse. Binary frames never fail.
pub fn decode_message(data: &[u8]) -> Result<ProtocolMessage, DecodeError> {
    if detect_kind(data) == MessageKind::Binary {
        return Ok(ProtocolMessage::Binary(data.to_vec()));
    }

    let mut parser = MessageParser::new();
    let raw = match parser.feed(data)? {
        Some(raw) => raw,
        None => parser.finish()?,
    };
    Ok(ProtocolMessage::Http(cast_message(raw)?))
}

/// Interpret a raw message body according to its declared content type.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] when a JSON-declared, non-HTML body does not
/// parse.
pub fn cast_message(raw: RawMessage) -> Result<HttpMessage, DecodeError> {
    let kind = raw.kind();
    let declared_json = raw
        .headers
        .get("content-type")
        .is_some_and(|value| value.contains("application/json"));
    let text = String::from_utf8_lossy(&raw.body);
    let html_error = declared_json && looks_like_html(&text);

    let status = match raw.status {
        Some(200) if html_error => Some(HTML_ERROR_STATUS),
        other => other,
    };

    let body = if raw.body.is_empty() || !declared_json {
        Value::Object(Map::new())
    } else if html_error {
        serde_json::json!({ "error": 1, "body": text })
    } else {
        serde_json::from_str(&text)?
    };

    let uri = match kind {
        MessageKind::Response => raw.headers.get("uri-origin").unwrap_or("/").to_owned(),
        _ => raw.uri.unwrap_or_default(),
    };

    Ok(HttpMessage { kind, method: raw.method, uri, status, headers: raw.headers, body, ts: now_ms() })
}

fn looks_like_html(text: &str) -> bool {
    text.trim_start()
        .get(..14)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("<!doctype html"))
}

// =============================================================================
// INCREMENTAL PARSER
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Head,
    Body,
    Chunks,
    Trailers,
    Done,
}

/// Incremental HTTP/1.x message parser.
///
/// Feed bytes as they arrive; [`MessageParser::feed`] returns the message
/// once its framing is complete. Messages without explicit framing (a
/// response with neither `content-length` nor chunked encoding) complete on
/// [`MessageParser::finish`].
#[derive(Debug)]
pub struct MessageParser {
    state: ParseState,
    framing: Framing,
    buffer: Vec<u8>,
    start: Option<RawMessage>,
    body: Vec<u8>,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    #[must_use]
    pub fn new() -> Self {
        Self { state: ParseState::Head, framing: Framing::Empty, buffer: Vec::new(), start: None, body: Vec::new() }
    }

    /// Append bytes and advance the parse.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for malformed start lines, headers,
    /// content lengths, or chunk sizes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<RawMessage>, DecodeError> {
        self.buffer.extend_from_slice(bytes);
        loop {
            match self.state {
                ParseState::Head => {
                    let Some(end) = find_header_end(&self.buffer) else {
                        return Ok(None);
                    };
                    let head = parse_head(&self.buffer[..end])?;
                    self.buffer.drain(..end + 4);
                    self.framing = framing_for(&head)?;
                    self.start = Some(head);
                    self.state = match self.framing {
                        Framing::Empty | Framing::Length(0) => ParseState::Done,
                        Framing::Length(_) | Framing::UntilEnd => ParseState::Body,
                        Framing::Chunked => ParseState::Chunks,
                    };
                }
                ParseState::Body => match self.framing {
                    Framing::Length(total) => {
                        let wanted = total - self.body.len();
                        let take = wanted.min(self.buffer.len());
                        self.body.extend(self.buffer.drain(..take));
                        if self.body.len() < total {
                            return Ok(None);
                        }
                        self.state = ParseState::Done;
                    }
                    _ => {
                        self.body.append(&mut self.buffer);
                        return Ok(None);
                    }
                },
                ParseState::Chunks => match decode_chunk(&self.buffer)? {
                    ChunkResult::NeedMore => return Ok(None),
                    ChunkResult::Complete { start, end, consumed, is_last } => {
                        self.body.extend_from_slice(&self.buffer[start..end]);
                        self.buffer.drain(..consumed);
                        if is_last {
                            self.state = ParseState::Trailers;
                        }
                    }
                },
                ParseState::Trailers => {
                    if self.buffer.starts_with(b"\r\n") {
                        self.buffer.drain(..2);
                    } else if let Some(end) = find_header_end(&self.buffer) {
                        self.buffer.drain(..end + 4);
                    } else {
                        return Ok(None);
                    }
                    self.state = ParseState::Done;
                }
                ParseState::Done => return Ok(self.take()),
            }
        }
    }

    /// Complete the message at end of input.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Incomplete`] when the framing still expects
    /// bytes (missing header terminator, short body, unterminated chunks).
    pub fn finish(&mut self) -> Result<RawMessage, DecodeError> {
        let complete = match self.state {
            ParseState::Done | ParseState::Trailers => true,
            ParseState::Body => self.framing == Framing::UntilEnd,
            ParseState::Head | ParseState::Chunks => false,
        };
        if !complete {
            return Err(DecodeError::Incomplete);
        }
        if self.framing == Framing::UntilEnd {
            self.body.append(&mut self.buffer);
        }
        self.buffer.clear();
        self.take().ok_or(DecodeError::Incomplete)
    }

    fn take(&mut self) -> Option<RawMessage> {
        let mut message = self.start.take()?;
        message.body = std::mem::take(&mut self.body);
        self.state = ParseState::Head;
        self.framing = Framing::Empty;
        Some(message)
    }
}

fn parse_head(data: &[u8]) -> Result<RawMessage, DecodeError> {
    let text = std::str::from_utf8(data).map_err(|_| DecodeError::InvalidUtf8)?;
    let mut lines = text.split("\r\n");
    let line = lines.next().unwrap_or_default();

    let mut message = match parse_start_line(line.as_bytes()) {
        Some(StartLine::Request { method, uri }) => {
            RawMessage { method: Some(method), uri: Some(uri), status: None, headers: Headers::new(), body: Vec::new() }
        }
        Some(StartLine::Response { status }) => {
            RawMessage { method: None, uri: None, status: Some(status), headers: Headers::new(), body: Vec::new() }
        }
        None => return Err(DecodeError::StartLine(line.to_owned())),
    };

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(DecodeError::HeaderLine(line.to_owned()));
        };
        message.headers.insert(name.trim(), value.trim());
    }

    Ok(message)
}

fn framing_for(head: &RawMessage) -> Result<Framing, DecodeError> {
    let chunked = head
        .headers
        .get("transfer-encoding")
        .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }
    if let Some(value) = head.headers.get("content-length") {
        let length = value.parse().map_err(|_| DecodeError::ContentLength(value.to_owned()))?;
        return Ok(Framing::Length(length));
    }
    match head.status {
        Some(100..=199 | 204 | 304) | None => Ok(Framing::Empty),
        Some(_) => Ok(Framing::UntilEnd),
    }
}

enum ChunkResult {
    Complete { start: usize, end: usize, consumed: usize, is_last: bool },
    NeedMore,
}

fn decode_chunk(data: &[u8]) -> Result<ChunkResult, DecodeError> {
    let Some(crlf) = find_crlf(data) else {
        return Ok(ChunkResult::NeedMore);
    };

    let line = std::str::from_utf8(&data[..crlf]).map_err(|_| DecodeError::InvalidUtf8)?;
    // Chunk extensions (;key=value) carry nothing we use.
    let size_hex = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_hex, 16).map_err(|_| DecodeError::ChunkSize(line.to_owned()))?;

    if size == 0 {
        return Ok(ChunkResult::Complete { start: 0, end: 0, consumed: crlf + 2, is_last: true });
    }

    let start = crlf + 2;
    let overflow = || DecodeError::ChunkSize(line.to_owned());
    let end = start.checked_add(size).ok_or_else(overflow)?;
    let consumed = end.checked_add(2).ok_or_else(overflow)?;
    if data.len() < consumed {
        return Ok(ChunkResult::NeedMore);
    }

    Ok(ChunkResult::Complete { start, end, consumed, is_last: false })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

// =============================================================================
// ENCODING
// =============================================================================

/// Serialize an outbound request in the layout the gateway expects:
/// start line, headers, a blank separator, then the body followed by its own
/// blank separator when present.
#[must_use]
pub fn encode_request(method: Method, uri: &str, headers: &[(&str, String)], body: &str) -> String {
    let mut raw = format!("{method} {uri} HTTP/1.1\r\n");
    for (name, value) in headers {
        raw.push_str(name);
        raw.push_str(": ");
        raw.push_str(value);
        raw.push_str("\r\n");
    }
    raw.push_str("\r\n\r\n");
    if !body.is_empty() {
        raw.push_str(body);
        raw.push_str("\r\n\r\n");
    }
    raw
}

// =============================================================================
// TRANSPORT FRAMING
// =============================================================================

/// How frames are stuffed for the host the client talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Through the remote relay: one control byte leads every frame.
    Relay,
    /// Direct to a gateway on the local network: frames pass unmodified.
    Direct,
}

impl Transport {
    /// Pick the framing for `hostname`; only the relay host is stuffed.
    #[must_use]
    pub fn for_host(hostname: &str, relay_host: &str) -> Self {
        if hostname.eq_ignore_ascii_case(relay_host) { Self::Relay } else { Self::Direct }
    }

    /// Frame outbound bytes for the socket.
    #[must_use]
    pub fn outbound(self, raw: &[u8]) -> Vec<u8> {
        match self {
            Self::Relay => {
                let mut framed = Vec::with_capacity(raw.len() + 1);
                framed.push(RELAY_CONTROL_BYTE);
                framed.extend_from_slice(raw);
                framed
            }
            Self::Direct => raw.to_vec(),
        }
    }

    /// Strip transport framing from an inbound frame.
    #[must_use]
    pub fn inbound(self, frame: &[u8]) -> &[u8] {
        match (self, frame.first()) {
            (Self::Relay, Some(&RELAY_CONTROL_BYTE)) => &frame[1..],
            _ => frame,
        }
    }
}

fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
