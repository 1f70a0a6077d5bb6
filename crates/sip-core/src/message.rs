//! SIP requests, responses, and the `Message` union.
//!
//! Messages keep their headers as an ordered sequence with duplicates
//! allowed (RFC 3261 Section 7.3). The typed accessors (`top_via`, `cseq`,
//! ...) parse raw header values on demand through the codec, so a message
//! assembled from the wire and a message built programmatically behave
//! identically.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::parser::parse_header_value;
use crate::types::{
    Address, CallId, CSeq, Header, HeaderName, HeaderValue, Method, StatusCode, Uri, ViaEntry,
};

/// The protocol version literal. Nothing else is accepted on the wire.
pub const SIP_VERSION: &str = "SIP/2.0";

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The request method.
    pub method: Method,
    /// The Request-URI.
    pub uri: Uri,
    /// Headers in wire order.
    pub headers: Vec<Header>,
    /// The message body.
    pub body: Bytes,
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The status code.
    pub status: StatusCode,
    /// The reason phrase as received or generated.
    pub reason: String,
    /// Headers in wire order.
    pub headers: Vec<Header>,
    /// The message body.
    pub body: Bytes,
}

/// Either a request or a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
}

/// Ordered header storage plus the typed accessors shared by requests and
/// responses.
///
/// The typed accessors return owned values: raw headers are parsed on the
/// fly (idempotently — already-typed values pass through), so repeated
/// access is safe and never mutates the message.
pub trait HeaderCarrier {
    /// The headers, in wire order.
    fn headers(&self) -> &[Header];
    /// Mutable access to the headers.
    fn headers_mut(&mut self) -> &mut Vec<Header>;

    /// The first header with the given name.
    fn header(&self, name: &HeaderName) -> Option<&Header> {
        self.headers().iter().find(|h| h.name == *name)
    }

    /// All headers with the given name, in order.
    fn headers_named<'a>(&'a self, name: &'a HeaderName) -> Box<dyn Iterator<Item = &'a Header> + 'a> {
        Box::new(self.headers().iter().filter(move |h| h.name == *name))
    }

    /// Appends a header at the end.
    fn push_header(&mut self, header: Header) {
        self.headers_mut().push(header);
    }

    /// Replaces every header of the given name with a single one, placed at
    /// the position of the first occurrence (or appended when absent).
    fn set_header(&mut self, header: Header) {
        let headers = self.headers_mut();
        match headers.iter().position(|h| h.name == header.name) {
            Some(idx) => {
                headers.retain(|h| h.name != header.name);
                headers.insert(idx.min(headers.len()), header);
            }
            None => headers.push(header),
        }
    }

    /// Removes every header with the given name.
    fn remove_headers(&mut self, name: &HeaderName) {
        self.headers_mut().retain(|h| h.name != *name);
    }

    /// All Via entries, in order, flattening comma-separated lines.
    fn via_entries(&self) -> Result<Vec<ViaEntry>> {
        let mut entries = Vec::new();
        for header in self.headers().iter().filter(|h| h.name == HeaderName::Via) {
            match parse_header_value(&header.name, &header.value)? {
                HeaderValue::Via(list) => entries.extend(list),
                _ => unreachable!("via parser yields Via values"),
            }
        }
        Ok(entries)
    }

    /// The topmost Via entry, which names the transaction.
    fn top_via(&self) -> Result<Option<ViaEntry>> {
        Ok(self.via_entries()?.into_iter().next())
    }

    /// The CSeq value.
    fn cseq(&self) -> Result<Option<CSeq>> {
        match self.parsed_first(&HeaderName::CSeq)? {
            Some(HeaderValue::CSeq(cseq)) => Ok(Some(cseq)),
            _ => Ok(None),
        }
    }

    /// The Call-Id value.
    fn call_id(&self) -> Result<Option<CallId>> {
        match self.parsed_first(&HeaderName::CallId)? {
            Some(HeaderValue::CallId(call_id)) => Ok(Some(call_id)),
            _ => Ok(None),
        }
    }

    /// The From address.
    fn from_address(&self) -> Result<Option<Address>> {
        match self.parsed_first(&HeaderName::From)? {
            Some(HeaderValue::Address(addr)) => Ok(Some(addr)),
            _ => Ok(None),
        }
    }

    /// The To address.
    fn to_address(&self) -> Result<Option<Address>> {
        match self.parsed_first(&HeaderName::To)? {
            Some(HeaderValue::Address(addr)) => Ok(Some(addr)),
            _ => Ok(None),
        }
    }

    /// The Content-Length value, when the header is present.
    fn content_length(&self) -> Result<Option<usize>> {
        match self.parsed_first(&HeaderName::ContentLength)? {
            Some(HeaderValue::UInt(n)) => Ok(Some(n as usize)),
            _ => Ok(None),
        }
    }

    /// The Max-Forwards value, when present.
    fn max_forwards(&self) -> Result<Option<u32>> {
        match self.parsed_first(&HeaderName::MaxForwards)? {
            Some(HeaderValue::UInt(n)) => Ok(Some(n)),
            _ => Ok(None),
        }
    }

    /// The Require token list (empty when the header is absent).
    fn require(&self) -> Result<Vec<String>> {
        self.token_list(&HeaderName::Require)
    }

    /// A comma-separated token list gathered across all headers of `name`.
    fn token_list(&self, name: &HeaderName) -> Result<Vec<String>> {
        let mut tokens = Vec::new();
        for header in self.headers().iter().filter(|h| h.name == *name) {
            match parse_header_value(&header.name, &header.value)? {
                HeaderValue::TokenList(list) => tokens.extend(list),
                other => {
                    return Err(Error::invalid_header(
                        name.as_str(),
                        format!("expected token list, got {:?}", other),
                    ))
                }
            }
        }
        Ok(tokens)
    }

    /// Parses the first header of `name` to its typed value.
    fn parsed_first(&self, name: &HeaderName) -> Result<Option<HeaderValue>> {
        match self.header(name) {
            Some(header) => Ok(Some(parse_header_value(&header.name, &header.value)?)),
            None => Ok(None),
        }
    }
}

impl HeaderCarrier for Request {
    fn headers(&self) -> &[Header] {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl HeaderCarrier for Response {
    fn headers(&self) -> &[Header] {
        &self.headers
    }
    fn headers_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl HeaderCarrier for Message {
    fn headers(&self) -> &[Header] {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }
    fn headers_mut(&mut self) -> &mut Vec<Header> {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }
}

impl Request {
    /// A request with no headers and an empty body.
    pub fn new(method: Method, uri: Uri) -> Request {
        Request {
            method,
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Serializes the request with canonical header casing and CRLF line
    /// endings.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(SIP_VERSION.as_bytes());
        out.extend_from_slice(b"\r\n");
        write_headers_and_body(&mut out, &self.headers, &self.body);
        Bytes::from(out)
    }
}

impl Response {
    /// A response with the default reason phrase for its status.
    pub fn new(status: StatusCode) -> Response {
        Response {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Overrides the reason phrase, builder style.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Response {
        self.reason = reason.into();
        self
    }

    /// Serializes the response with canonical header casing and CRLF line
    /// endings.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(SIP_VERSION.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        write_headers_and_body(&mut out, &self.headers, &self.body);
        Bytes::from(out)
    }
}

impl Message {
    /// True for requests.
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    /// True for responses.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }

    /// The method, for requests.
    pub fn method(&self) -> Option<&Method> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Response(_) => None,
        }
    }

    /// The status code, for responses.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Message::Request(_) => None,
            Message::Response(r) => Some(r.status),
        }
    }

    /// The request, if this is one.
    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            _ => None,
        }
    }

    /// The response, if this is one.
    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(r) => Some(r),
            _ => None,
        }
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(r) => r.to_bytes(),
            Message::Response(r) => r.to_bytes(),
        }
    }
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Message::Request(r)
    }
}

impl From<Response> for Message {
    fn from(r: Response) -> Self {
        Message::Response(r)
    }
}

fn write_headers_and_body(out: &mut Vec<u8>, headers: &[Header], body: &Bytes) {
    for header in headers {
        out.extend_from_slice(header.name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        match &header.value {
            // Raw values round-trip byte for byte.
            HeaderValue::Raw(bytes) => out.extend_from_slice(bytes),
            typed => out.extend_from_slice(typed.to_string().as_bytes()),
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        let mut req = Request::new(Method::Invite, Uri::sip("bob@example.com"));
        req.headers.push(Header::text(HeaderName::CallId, "call-1"));
        req.headers.push(Header::text(HeaderName::CSeq, "1 INVITE"));
        req
    }

    #[test]
    fn request_serializes_start_line() {
        let bytes = invite().to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("INVITE sip:bob@example.com SIP/2.0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_serializes_status_line() {
        let resp = Response::new(StatusCode::RINGING);
        let bytes = resp.to_bytes();
        assert!(bytes.starts_with(b"SIP/2.0 180 Ringing\r\n"));
    }

    #[test]
    fn typed_accessors_parse_raw_headers() {
        let req = invite();
        let cseq = req.cseq().unwrap().unwrap();
        assert_eq!(cseq, CSeq::new(1, Method::Invite));
        assert_eq!(req.call_id().unwrap().unwrap().as_str(), "call-1");
    }

    #[test]
    fn set_header_replaces_at_first_position() {
        let mut req = invite();
        req.push_header(Header::text(HeaderName::CallId, "dup"));
        req.set_header(Header::text(HeaderName::CallId, "only"));
        let call_ids: Vec<_> = req.headers_named(&HeaderName::CallId).collect();
        assert_eq!(call_ids.len(), 1);
        assert_eq!(req.headers[0].name, HeaderName::CallId);
    }

    #[test]
    fn duplicate_headers_are_preserved_in_order() {
        let mut req = invite();
        req.push_header(Header::text(HeaderName::RecordRoute, "<sip:p1.example.com;lr>"));
        req.push_header(Header::text(HeaderName::RecordRoute, "<sip:p2.example.com;lr>"));
        let routes: Vec<_> = req
            .headers_named(&HeaderName::RecordRoute)
            .map(|h| h.value.as_text().unwrap().to_string())
            .collect();
        assert_eq!(routes, vec!["<sip:p1.example.com;lr>", "<sip:p2.example.com;lr>"]);
    }
}
