//! Fluent builders for requests and responses.
//!
//! The builders cover what the transaction layer and its tests need:
//! assembling a well-formed request from scratch, and deriving a response
//! from a request by copying the headers RFC 3261 Section 8.2.6.2 requires
//! (Via, From, To, Call-Id, CSeq).

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::message::{HeaderCarrier, Request, Response};
use crate::types::{
    Address, CallId, CSeq, Header, HeaderName, HeaderValue, Method, StatusCode, Uri, ViaEntry,
};

/// Builds a [`Request`] header by header.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    /// Starts a request with the given method and Request-URI.
    pub fn new(method: Method, uri: &str) -> Result<RequestBuilder> {
        Ok(RequestBuilder {
            request: Request::new(method, Uri::new(uri)?),
        })
    }

    /// Adds a From header with optional display name and tag.
    pub fn from(mut self, display_name: Option<&str>, uri: &str, tag: Option<&str>) -> Result<RequestBuilder> {
        let mut addr = Address::new(Uri::new(uri)?);
        if let Some(name) = display_name {
            addr = addr.with_display_name(name);
        }
        if let Some(tag) = tag {
            addr = addr.with_tag(tag);
        }
        self.request
            .push_header(Header::typed(HeaderName::From, HeaderValue::Address(addr)));
        Ok(self)
    }

    /// Adds a To header with optional display name and tag.
    pub fn to(mut self, display_name: Option<&str>, uri: &str, tag: Option<&str>) -> Result<RequestBuilder> {
        let mut addr = Address::new(Uri::new(uri)?);
        if let Some(name) = display_name {
            addr = addr.with_display_name(name);
        }
        if let Some(tag) = tag {
            addr = addr.with_tag(tag);
        }
        self.request
            .push_header(Header::typed(HeaderName::To, HeaderValue::Address(addr)));
        Ok(self)
    }

    /// Adds a Via header at the top.
    pub fn via(mut self, host: &str, port: Option<u16>, transport: &str, branch: Option<&str>) -> RequestBuilder {
        let mut via = ViaEntry::new(transport, host, port);
        if let Some(branch) = branch {
            via = via.with_branch(branch);
        }
        self.request
            .headers
            .insert(0, Header::typed(HeaderName::Via, HeaderValue::Via(vec![via])));
        self
    }

    /// Adds a Call-Id header.
    pub fn call_id(mut self, value: &str) -> RequestBuilder {
        self.request
            .push_header(Header::typed(HeaderName::CallId, HeaderValue::CallId(CallId::new(value))));
        self
    }

    /// Adds a CSeq header with the request's own method.
    pub fn cseq(mut self, seq: u32) -> RequestBuilder {
        let cseq = CSeq::new(seq, self.request.method.clone());
        self.request
            .push_header(Header::typed(HeaderName::CSeq, HeaderValue::CSeq(cseq)));
        self
    }

    /// Adds a Max-Forwards header.
    pub fn max_forwards(mut self, hops: u32) -> RequestBuilder {
        self.request
            .push_header(Header::typed(HeaderName::MaxForwards, HeaderValue::UInt(hops)));
        self
    }

    /// Adds an arbitrary header.
    pub fn header(mut self, header: Header) -> RequestBuilder {
        self.request.push_header(header);
        self
    }

    /// Sets the body and a matching Content-Length.
    pub fn body(mut self, body: impl Into<Bytes>) -> RequestBuilder {
        let body = body.into();
        self.request
            .set_header(Header::typed(HeaderName::ContentLength, HeaderValue::UInt(body.len() as u32)));
        self.request.body = body;
        self
    }

    /// Finishes the request, adding `Content-Length: 0` when no body was
    /// set and none is present.
    pub fn build(mut self) -> Request {
        if self.request.header(&HeaderName::ContentLength).is_none() {
            self.request.push_header(Header::typed(
                HeaderName::ContentLength,
                HeaderValue::UInt(self.request.body.len() as u32),
            ));
        }
        self.request
    }
}

/// Builds a [`Response`], usually derived from the request it answers.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    /// Starts a bare response with the default reason phrase.
    pub fn new(status: StatusCode) -> ResponseBuilder {
        ResponseBuilder {
            response: Response::new(status),
        }
    }

    /// Starts a response to `request`, copying Via (all of them, in
    /// order), From, To, Call-Id and CSeq per RFC 3261 Section 8.2.6.2.
    pub fn from_request(status: StatusCode, request: &Request) -> ResponseBuilder {
        let mut response = Response::new(status);
        for name in [
            HeaderName::Via,
            HeaderName::From,
            HeaderName::To,
            HeaderName::CallId,
            HeaderName::CSeq,
        ] {
            for header in request.headers_named(&name) {
                response.push_header(header.clone());
            }
        }
        ResponseBuilder { response }
    }

    /// Overrides the reason phrase.
    pub fn reason(mut self, reason: &str) -> ResponseBuilder {
        self.response.reason = reason.to_string();
        self
    }

    /// Adds an arbitrary header.
    pub fn header(mut self, header: Header) -> ResponseBuilder {
        self.response.push_header(header);
        self
    }

    /// Replaces the To header with one carrying the given tag.
    pub fn to_tag(mut self, tag: &str) -> Result<ResponseBuilder> {
        let addr = self
            .response
            .to_address()?
            .ok_or(Error::MissingHeader("To"))?;
        self.response.set_header(Header::typed(
            HeaderName::To,
            HeaderValue::Address(addr.with_tag(tag)),
        ));
        Ok(self)
    }

    /// Sets the body and a matching Content-Length.
    pub fn body(mut self, body: impl Into<Bytes>) -> ResponseBuilder {
        let body = body.into();
        self.response
            .set_header(Header::typed(HeaderName::ContentLength, HeaderValue::UInt(body.len() as u32)));
        self.response.body = body;
        self
    }

    /// Finishes the response, defaulting Content-Length to the body size.
    pub fn build(mut self) -> Response {
        if self.response.header(&HeaderName::ContentLength).is_none() {
            self.response.push_header(Header::typed(
                HeaderName::ContentLength,
                HeaderValue::UInt(self.response.body.len() as u32),
            ));
        }
        self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@biloxi.example.com")
            .unwrap()
            .via("pc33.atlanta.example.com", None, "UDP", Some("z9hG4bK776asdhds"))
            .from(Some("Alice"), "sip:alice@atlanta.example.com", Some("1928301774"))
            .unwrap()
            .to(Some("Bob"), "sip:bob@biloxi.example.com", None)
            .unwrap()
            .call_id("a84b4c76e66710")
            .cseq(314159)
            .max_forwards(70)
            .build()
    }

    #[test]
    fn request_builder_produces_well_formed_invite() {
        let req = sample_invite();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.top_via().unwrap().unwrap().branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(req.cseq().unwrap().unwrap(), CSeq::new(314159, Method::Invite));
        assert_eq!(req.content_length().unwrap(), Some(0));
    }

    #[test]
    fn built_request_parses_back() {
        let req = sample_invite();
        let bytes = req.to_bytes();
        let reparsed = crate::parser::parse_datagram(&bytes).unwrap();
        let reparsed = reparsed.as_request().unwrap();
        assert_eq!(reparsed.method, req.method);
        assert_eq!(reparsed.uri, req.uri);
        assert_eq!(
            reparsed.top_via().unwrap().unwrap().branch(),
            Some("z9hG4bK776asdhds")
        );
        assert_eq!(
            reparsed.from_address().unwrap().unwrap().tag(),
            Some("1928301774")
        );
    }

    #[test]
    fn response_from_request_copies_identity_headers() {
        let req = sample_invite();
        let resp = ResponseBuilder::from_request(StatusCode::OK, &req).build();
        assert_eq!(resp.cseq().unwrap().unwrap(), CSeq::new(314159, Method::Invite));
        assert_eq!(resp.call_id().unwrap().unwrap().as_str(), "a84b4c76e66710");
        assert_eq!(
            resp.top_via().unwrap().unwrap().branch(),
            Some("z9hG4bK776asdhds")
        );
        // To copied without a tag; the UA layer adds one for final responses.
        assert!(resp.to_address().unwrap().unwrap().tag().is_none());
    }

    #[test]
    fn to_tag_replaces_in_place() {
        let req = sample_invite();
        let resp = ResponseBuilder::from_request(StatusCode::BUSY_HERE, &req)
            .to_tag("server-tag")
            .unwrap()
            .build();
        assert_eq!(resp.to_address().unwrap().unwrap().tag(), Some("server-tag"));
    }

    #[test]
    fn body_sets_content_length() {
        let req = RequestBuilder::new(Method::Message, "sip:a@b")
            .unwrap()
            .body("hello")
            .build();
        assert_eq!(req.content_length().unwrap(), Some(5));
        assert_eq!(&req.body[..], b"hello");
    }
}
