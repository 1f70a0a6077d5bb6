//! Message derivation helpers: branches, tags, ACK and CANCEL
//! construction, response scaffolding.

use uuid::Uuid;

use sipflow_sip_core::builder::ResponseBuilder;
use sipflow_sip_core::message::HeaderCarrier;
use sipflow_sip_core::{
    Header, HeaderName, HeaderValue, Method, Request, Response, StatusCode, MAGIC_COOKIE,
};

use crate::error::{Error, Result};

/// Generates an RFC 3261 branch: the magic cookie plus a v4 UUID (122
/// random bits, comfortably above the 72-bit uniqueness recommendation).
pub fn generate_branch() -> String {
    format!("{}-{}", MAGIC_COOKIE, Uuid::new_v4().simple())
}

/// Generates a From/To tag (64+ bits of entropy per Section 19.3).
pub fn generate_tag() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Builds the ACK for a non-2xx final response, per RFC 3261 Section
/// 17.1.1.3: Request-URI, Call-Id, From, top Via and Route set from the
/// original INVITE; To from the response (it carries the to-tag); CSeq
/// number from the INVITE with method ACK; empty body.
pub fn create_ack_from_invite(original: &Request, response: &Response) -> Result<Request> {
    if original.method != Method::Invite {
        return Err(Error::InvalidOperation(
            "ACK is generated for INVITE transactions only".to_string(),
        ));
    }

    let mut ack = Request::new(Method::Ack, original.uri.clone());

    let top_via = original
        .top_via()?
        .ok_or(sipflow_sip_core::Error::MissingHeader("Via"))?;
    ack.push_header(Header::typed(HeaderName::Via, HeaderValue::Via(vec![top_via])));

    // Route set copies over so the ACK retraces the INVITE's path.
    for route in original.headers_named(&HeaderName::Route) {
        ack.push_header(route.clone());
    }

    let from = original
        .header(&HeaderName::From)
        .ok_or(sipflow_sip_core::Error::MissingHeader("From"))?;
    ack.push_header(from.clone());

    let to = response
        .header(&HeaderName::To)
        .ok_or(sipflow_sip_core::Error::MissingHeader("To"))?;
    ack.push_header(to.clone());

    let call_id = original
        .header(&HeaderName::CallId)
        .ok_or(sipflow_sip_core::Error::MissingHeader("Call-Id"))?;
    ack.push_header(call_id.clone());

    let cseq = original
        .cseq()?
        .ok_or(sipflow_sip_core::Error::MissingHeader("CSeq"))?;
    ack.push_header(Header::typed(HeaderName::CSeq, HeaderValue::CSeq(cseq.for_ack())));

    ack.push_header(Header::typed(HeaderName::ContentLength, HeaderValue::UInt(0)));
    Ok(ack)
}

/// Builds a CANCEL for a pending request, per RFC 3261 Section 9.1: same
/// Request-URI, top Via (same branch), From, To, Call-Id and CSeq number,
/// with the method set to CANCEL.
pub fn create_cancel(original: &Request) -> Result<Request> {
    if matches!(original.method, Method::Ack | Method::Cancel) {
        return Err(Error::InvalidOperation(format!(
            "{} cannot be cancelled",
            original.method
        )));
    }

    let mut cancel = Request::new(Method::Cancel, original.uri.clone());

    let top_via = original
        .top_via()?
        .ok_or(sipflow_sip_core::Error::MissingHeader("Via"))?;
    cancel.push_header(Header::typed(HeaderName::Via, HeaderValue::Via(vec![top_via])));

    for name in [HeaderName::From, HeaderName::To, HeaderName::CallId] {
        let header = original
            .header(&name)
            .ok_or(sipflow_sip_core::Error::MissingHeader("From/To/Call-Id"))?;
        cancel.push_header(header.clone());
    }

    for route in original.headers_named(&HeaderName::Route) {
        cancel.push_header(route.clone());
    }

    let cseq = original
        .cseq()?
        .ok_or(sipflow_sip_core::Error::MissingHeader("CSeq"))?;
    cancel.push_header(Header::typed(HeaderName::CSeq, HeaderValue::CSeq(cseq.for_cancel())));

    cancel.push_header(Header::typed(HeaderName::ContentLength, HeaderValue::UInt(0)));
    Ok(cancel)
}

/// Scaffolds a response to `request` with the identity headers copied per
/// RFC 3261 Section 8.2.6.2.
pub fn create_response(request: &Request, status: StatusCode) -> Response {
    ResponseBuilder::from_request(status, request).build()
}

/// Scaffolds a response with an explicit reason phrase.
pub fn create_response_with_reason(request: &Request, status: StatusCode, reason: &str) -> Response {
    ResponseBuilder::from_request(status, request).reason(reason).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::prelude::*;

    fn invite() -> Request {
        RequestBuilder::new(Method::Invite, "sip:bob@biloxi.example.com")
            .unwrap()
            .via("client.atlanta.example.com", Some(5060), "UDP", Some("z9hG4bK-ack-test"))
            .from(Some("Alice"), "sip:alice@atlanta.example.com", Some("ft-77"))
            .unwrap()
            .to(Some("Bob"), "sip:bob@biloxi.example.com", None)
            .unwrap()
            .call_id("ack-call-1")
            .cseq(9)
            .header(Header::text(HeaderName::Route, "<sip:proxy.example.com;lr>"))
            .build()
    }

    #[test]
    fn branches_carry_the_cookie_and_differ() {
        let a = generate_branch();
        let b = generate_branch();
        assert!(a.starts_with(MAGIC_COOKIE));
        assert_ne!(a, b);
    }

    #[test]
    fn ack_copies_identity_and_takes_to_from_response() {
        let invite = invite();
        let response = ResponseBuilder::from_request(StatusCode::BUSY_HERE, &invite)
            .to_tag("server-tag-1")
            .unwrap()
            .build();

        let ack = create_ack_from_invite(&invite, &response).unwrap();
        assert_eq!(ack.method, Method::Ack);
        assert_eq!(ack.uri, invite.uri);
        assert_eq!(ack.cseq().unwrap().unwrap(), CSeq::new(9, Method::Ack));
        assert_eq!(ack.to_address().unwrap().unwrap().tag(), Some("server-tag-1"));
        assert_eq!(ack.from_address().unwrap().unwrap().tag(), Some("ft-77"));
        assert_eq!(
            ack.top_via().unwrap().unwrap().branch(),
            Some("z9hG4bK-ack-test")
        );
        assert!(ack.header(&HeaderName::Route).is_some());
        assert!(ack.body.is_empty());
    }

    #[test]
    fn ack_requires_an_invite() {
        let options = RequestBuilder::new(Method::Options, "sip:a@b").unwrap().build();
        let response = ResponseBuilder::from_request(StatusCode::OK, &options).build();
        assert!(create_ack_from_invite(&options, &response).is_err());
    }

    #[test]
    fn cancel_shares_branch_and_cseq_number() {
        let invite = invite();
        let cancel = create_cancel(&invite).unwrap();
        assert_eq!(cancel.method, Method::Cancel);
        assert_eq!(cancel.cseq().unwrap().unwrap(), CSeq::new(9, Method::Cancel));
        assert_eq!(
            cancel.top_via().unwrap().unwrap().branch(),
            invite.top_via().unwrap().unwrap().branch()
        );
        // To copied from the request, not a response: no tag yet.
        assert!(cancel.to_address().unwrap().unwrap().tag().is_none());
    }

    #[test]
    fn cancel_rejects_ack_and_cancel() {
        let invite = invite();
        let cancel = create_cancel(&invite).unwrap();
        assert!(create_cancel(&cancel).is_err());
    }
}
