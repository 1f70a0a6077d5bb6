//! Message framing and start-line parsing.
//!
//! Two entry points mirror the two transport shapes:
//!
//! - [`parse_datagram`] is single-shot: one datagram carries exactly one
//!   message, and a missing `Content-Length` means the body is the rest of
//!   the datagram.
//! - [`StreamParser`] is stateful and incremental: bytes arrive in
//!   arbitrary chunks, messages MUST carry `Content-Length` to be
//!   delimitable (RFC 3261 Section 18.3), and CRLFs before a start line
//!   are ignored (Section 7.5).
//!
//! Header lines are split on CRLF with folded continuations (CRLF followed
//! by SP/HT) collapsed to a single SP before the name/value split.

pub mod headers;

pub use headers::{parse_address, parse_cseq, parse_header_value, parse_via};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{Message, Request, Response, SIP_VERSION};
use crate::types::{Header, HeaderName, Method, StatusCode, Uri};

/// Parses one datagram into one message.
///
/// `Content-Length` larger than the bytes present fails with
/// [`Error::ContentTooSmall`], carrying the partially assembled message
/// (headers plus whatever body arrived) for diagnostics. A missing
/// `Content-Length` takes the remainder of the datagram as the body.
pub fn parse_datagram(data: &[u8]) -> Result<Message> {
    let data = skip_leading_crlf(data);
    let (head, rest) = split_head(data)?;
    let mut message = parse_head(head)?;

    use crate::message::HeaderCarrier;
    match message.content_length()? {
        Some(expected) if expected > rest.len() => {
            set_body(&mut message, Bytes::copy_from_slice(rest));
            Err(Error::ContentTooSmall {
                expected,
                actual: rest.len(),
                partial: Box::new(message),
            })
        }
        Some(expected) => {
            set_body(&mut message, Bytes::copy_from_slice(&rest[..expected]));
            Ok(message)
        }
        None => {
            set_body(&mut message, Bytes::copy_from_slice(rest));
            Ok(message)
        }
    }
}

/// Incremental parser for stream transports.
///
/// Feed bytes as they arrive, then drain complete messages:
///
/// ```
/// use sipflow_sip_core::parser::StreamParser;
///
/// let mut parser = StreamParser::new();
/// parser.feed(b"OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\n");
/// let message = parser.next_message().unwrap().expect("one whole message");
/// assert!(message.is_request());
/// assert!(parser.next_message().unwrap().is_none());
/// ```
#[derive(Debug, Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    state: StreamState,
}

/// Framing state: before a start line, accumulating the head, or counting
/// down a body.
#[derive(Debug, Default)]
enum StreamState {
    #[default]
    Before,
    Body {
        message: Message,
        remaining: usize,
    },
}

impl StreamParser {
    /// A parser with empty framing state.
    pub fn new() -> StreamParser {
        StreamParser::default()
    }

    /// Appends received bytes to the framing buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extracts the next complete message, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. A message without
    /// `Content-Length` yields [`Error::NoContentLength`] with the partial
    /// message, and the framing state is reset — the caller is expected to
    /// drop the connection or re-synchronize.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            match std::mem::take(&mut self.state) {
                StreamState::Before => {
                    let skipped = self.buffer.len() - skip_leading_crlf(&self.buffer).len();
                    self.buffer.drain(..skipped);
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }

                    let Some(head_end) = find_head_end(&self.buffer) else {
                        return Ok(None);
                    };
                    let head: Vec<u8> = self.buffer.drain(..head_end + 4).collect();
                    let message = match parse_head(&head[..head_end]) {
                        Ok(message) => message,
                        Err(e) => {
                            self.reset();
                            return Err(e);
                        }
                    };

                    use crate::message::HeaderCarrier;
                    let Some(remaining) = message.content_length()? else {
                        self.reset();
                        return Err(Error::NoContentLength {
                            partial: Box::new(message),
                        });
                    };
                    self.state = StreamState::Body { message, remaining };
                }
                StreamState::Body { mut message, remaining } => {
                    if self.buffer.len() < remaining {
                        self.state = StreamState::Body { message, remaining };
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buffer.drain(..remaining).collect();
                    set_body(&mut message, Bytes::from(body));
                    return Ok(Some(message));
                }
            }
        }
    }

    /// Drops all buffered bytes and returns to the initial framing state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = StreamState::Before;
    }
}

// ---- shared framing helpers ----

fn skip_leading_crlf(data: &[u8]) -> &[u8] {
    let mut rest = data;
    while rest.starts_with(b"\r\n") {
        rest = &rest[2..];
    }
    rest
}

fn split_head(data: &[u8]) -> Result<(&[u8], &[u8])> {
    match find_head_end(data) {
        Some(idx) => Ok((&data[..idx], &data[idx + 4..])),
        None => Err(Error::InvalidStartLine(
            "message truncated before end of headers".to_string(),
        )),
    }
}

fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parses the start line and headers (no body) of a message.
fn parse_head(head: &[u8]) -> Result<Message> {
    let mut lines = unfold_lines(head)?;
    if lines.is_empty() {
        return Err(Error::InvalidStartLine("empty message head".to_string()));
    }
    let start_line = lines.remove(0);

    let mut headers = Vec::with_capacity(lines.len());
    for line in &lines {
        headers.push(parse_header_line(line)?);
    }

    if let Some(rest) = start_line.strip_prefix(&format!("{} ", SIP_VERSION)) {
        let (code, reason) = rest
            .split_once(' ')
            .map(|(c, r)| (c, r.to_string()))
            .unwrap_or((rest, String::new()));
        let code: u16 = code
            .parse()
            .map_err(|_| Error::InvalidStatusCode(code.to_string()))?;
        let status = StatusCode::new(code)?;
        Ok(Message::Response(Response {
            status,
            reason,
            headers,
            body: Bytes::new(),
        }))
    } else {
        let mut parts = start_line.splitn(3, ' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => return Err(Error::InvalidStartLine(start_line.clone())),
        };
        if version != SIP_VERSION {
            return Err(Error::InvalidVersion);
        }
        let method: Method = method.parse()?;
        let uri = Uri::new(uri)?;
        Ok(Message::Request(Request {
            method,
            uri,
            headers,
            body: Bytes::new(),
        }))
    }
}

/// Splits the head into logical lines, collapsing folded continuations
/// (CRLF SP/HT) into a single SP.
fn unfold_lines(head: &[u8]) -> Result<Vec<String>> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::InvalidStartLine("head is not valid UTF-8".to_string()))?;

    let mut lines: Vec<String> = Vec::new();
    for raw_line in text.split("\r\n") {
        if raw_line.starts_with(' ') || raw_line.starts_with('\t') {
            match lines.last_mut() {
                Some(prev) => {
                    prev.push(' ');
                    prev.push_str(raw_line.trim_start_matches([' ', '\t']));
                }
                None => {
                    return Err(Error::InvalidStartLine(
                        "message begins with a folded line".to_string(),
                    ))
                }
            }
        } else {
            lines.push(raw_line.to_string());
        }
    }
    Ok(lines)
}

fn parse_header_line(line: &str) -> Result<Header> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| Error::invalid_header(line, "missing colon"))?;
    let name: HeaderName = name.trim_end().parse()?;
    Ok(Header::raw(name, value.trim().as_bytes().to_vec()))
}

fn set_body(message: &mut Message, body: Bytes) {
    match message {
        Message::Request(r) => r.body = body,
        Message::Response(r) => r.body = body,
    }
}
