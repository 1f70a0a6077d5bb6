//! Transaction identification.
//!
//! RFC 3261 Sections 17.1.3 and 17.2.3 define how messages are matched to
//! transactions. For RFC 3261 senders, the `branch` parameter of the top
//! Via — which opens with the magic cookie `z9hG4bK` — identifies the
//! transaction. Server keys additionally carry the top Via sent-by
//! host/port, and normalize ACK to INVITE so an ACK lands on the INVITE
//! server transaction it acknowledges. Client keys match responses by
//! branch plus CSeq method (so a CANCEL's responses stay out of the
//! INVITE's transaction).
//!
//! Requests from pre-RFC-3261 senders have no magic cookie; those take the
//! Section 17.2.3 fallback and are keyed on a digest of the full matching
//! tuple (top Via, Call-Id, CSeq number, From-tag, To-tag, Request-URI).

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use sipflow_sip_core::message::HeaderCarrier;
use sipflow_sip_core::{Method, Request, Response, MAGIC_COOKIE};

use crate::error::{Error, Result};

/// Which side of the transaction a key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    /// A client transaction: matches responses.
    Client,
    /// A server transaction: matches requests.
    Server,
}

/// Uniquely identifies a transaction within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    /// The branch from the top Via (or the Section 17.2.3 fallback digest
    /// for pre-RFC-3261 requests).
    pub branch: String,
    /// The transaction's method. Server keys store ACK normalized to
    /// INVITE; client keys store the CSeq method.
    pub method: Method,
    /// Client or server side.
    pub role: TransactionRole,
    /// Top Via sent-by `(host, port)`; server keys only.
    pub sent_by: Option<(String, u16)>,
}

impl TransactionKey {
    /// Builds a client transaction key.
    pub fn client(branch: impl Into<String>, method: Method) -> TransactionKey {
        TransactionKey {
            branch: branch.into(),
            method,
            role: TransactionRole::Client,
            sent_by: None,
        }
    }

    /// Builds a server transaction key, normalizing ACK to INVITE.
    pub fn server(
        branch: impl Into<String>,
        method: Method,
        sent_by_host: impl Into<String>,
        sent_by_port: u16,
    ) -> TransactionKey {
        TransactionKey {
            branch: branch.into(),
            method: method.for_server_matching(),
            role: TransactionRole::Server,
            sent_by: Some((sent_by_host.into().to_ascii_lowercase(), sent_by_port)),
        }
    }

    /// Derives the server key an incoming request matches against
    /// (RFC 3261 Section 17.2.3).
    pub fn from_request(request: &Request) -> Result<TransactionKey> {
        let via = request
            .top_via()
            .map_err(|e| Error::KeyUnderivable(e.to_string()))?
            .ok_or_else(|| Error::KeyUnderivable("request has no Via header".to_string()))?;

        let branch = match via.branch() {
            Some(branch) if branch.starts_with(MAGIC_COOKIE) && branch.len() > MAGIC_COOKIE.len() => {
                branch.to_string()
            }
            // Pre-RFC-3261 sender (or an empty/absent branch): fall back to
            // the full matching tuple, folded into a stable digest.
            _ => legacy_branch(request, &via)?,
        };

        Ok(TransactionKey::server(
            branch,
            request.method.clone(),
            via.sent_by_host.clone(),
            via.port_or_default(),
        ))
    }

    /// Derives the client key an incoming response matches against
    /// (RFC 3261 Section 17.1.3): top Via branch plus CSeq method.
    pub fn from_response(response: &Response) -> Result<TransactionKey> {
        let via = response
            .top_via()
            .map_err(|e| Error::KeyUnderivable(e.to_string()))?
            .ok_or_else(|| Error::KeyUnderivable("response has no Via header".to_string()))?;
        let branch = via
            .branch()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::KeyUnderivable("response Via has no branch".to_string()))?;
        let cseq = response
            .cseq()
            .map_err(|e| Error::KeyUnderivable(e.to_string()))?
            .ok_or_else(|| Error::KeyUnderivable("response has no CSeq".to_string()))?;
        Ok(TransactionKey::client(branch, cseq.method))
    }

    /// The key the client transaction for `request` registers under.
    pub fn for_client_request(request: &Request) -> Result<TransactionKey> {
        let via = request
            .top_via()
            .map_err(|e| Error::KeyUnderivable(e.to_string()))?
            .ok_or_else(|| Error::KeyUnderivable("request has no Via header".to_string()))?;
        let branch = via
            .branch()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::KeyUnderivable("request Via has no branch".to_string()))?;
        Ok(TransactionKey::client(branch, request.method.clone()))
    }

    /// True for server-side keys.
    pub fn is_server(&self) -> bool {
        self.role == TransactionRole::Server
    }
}

/// Folds the RFC 3261 Section 17.2.3 fallback tuple into a branch-shaped
/// token. The digest keeps retransmissions equal (same tuple, same token)
/// while keeping distinct transactions apart within hash quality.
fn legacy_branch(request: &Request, via: &sipflow_sip_core::ViaEntry) -> Result<String> {
    let call_id = request
        .call_id()
        .map_err(|e| Error::KeyUnderivable(e.to_string()))?
        .ok_or_else(|| Error::KeyUnderivable("legacy request has no Call-Id".to_string()))?;
    let cseq = request
        .cseq()
        .map_err(|e| Error::KeyUnderivable(e.to_string()))?
        .ok_or_else(|| Error::KeyUnderivable("legacy request has no CSeq".to_string()))?;
    let from_tag = request
        .from_address()
        .map_err(|e| Error::KeyUnderivable(e.to_string()))?
        .and_then(|a| a.tag().map(str::to_string))
        .unwrap_or_default();
    let to_tag = request
        .to_address()
        .map_err(|e| Error::KeyUnderivable(e.to_string()))?
        .and_then(|a| a.tag().map(str::to_string))
        .unwrap_or_default();

    let mut hasher = DefaultHasher::new();
    via.to_string().hash(&mut hasher);
    call_id.as_str().hash(&mut hasher);
    cseq.seq.hash(&mut hasher);
    from_tag.hash(&mut hasher);
    to_tag.hash(&mut hasher);
    request.uri.as_str().hash(&mut hasher);
    Ok(format!("rfc2543-{:016x}", hasher.finish()))
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.role {
            TransactionRole::Client => "client",
            TransactionRole::Server => "server",
        };
        match &self.sent_by {
            Some((host, port)) => write!(f, "{}:{}:{}:{}:{}", self.branch, self.method, side, host, port),
            None => write!(f, "{}:{}:{}", self.branch, self.method, side),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::prelude::*;

    fn request(method: Method, branch: Option<&str>) -> Request {
        let mut builder = RequestBuilder::new(method, "sip:service@10.0.0.2").unwrap();
        builder = builder
            .via("10.0.0.1", Some(5060), "UDP", branch)
            .from(Some("Alice"), "sip:alice@example.com", Some("ft-1"))
            .unwrap()
            .to(None, "sip:service@10.0.0.2", None)
            .unwrap()
            .call_id("cid-key-tests")
            .cseq(1);
        builder.build()
    }

    #[test]
    fn server_keys_of_identical_requests_match() {
        let a = TransactionKey::from_request(&request(Method::Invite, Some("z9hG4bK-abc"))).unwrap();
        let b = TransactionKey::from_request(&request(Method::Invite, Some("z9hG4bK-abc"))).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ack_maps_to_the_invite_server_key() {
        // An ACK to a non-2xx final with the same branch/host/port
        // must land on the INVITE server transaction.
        let invite = TransactionKey::from_request(&request(Method::Invite, Some("z9hG4bK-abc"))).unwrap();
        let ack = TransactionKey::from_request(&request(Method::Ack, Some("z9hG4bK-abc"))).unwrap();
        assert_eq!(invite, ack);
        assert_eq!(ack.method, Method::Invite);
    }

    #[test]
    fn cancel_is_its_own_transaction() {
        let invite = TransactionKey::from_request(&request(Method::Invite, Some("z9hG4bK-abc"))).unwrap();
        let cancel = TransactionKey::from_request(&request(Method::Cancel, Some("z9hG4bK-abc"))).unwrap();
        assert_ne!(invite, cancel);
    }

    #[test]
    fn sent_by_differentiates_server_keys() {
        let a = TransactionKey::server("z9hG4bK-abc", Method::Invite, "10.0.0.1", 5060);
        let b = TransactionKey::server("z9hG4bK-abc", Method::Invite, "10.0.0.2", 5060);
        let c = TransactionKey::server("z9hG4bK-abc", Method::Invite, "10.0.0.1", 5061);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn client_and_server_keys_never_collide() {
        let client = TransactionKey::client("z9hG4bK-abc", Method::Invite);
        let server = TransactionKey::server("z9hG4bK-abc", Method::Invite, "10.0.0.1", 5060);
        assert_ne!(client, server);
    }

    #[test]
    fn legacy_branch_is_stable_across_retransmissions() {
        let a = TransactionKey::from_request(&request(Method::Invite, Some("old-style-1"))).unwrap();
        let b = TransactionKey::from_request(&request(Method::Invite, Some("old-style-1"))).unwrap();
        assert_eq!(a, b);
        assert!(a.branch.starts_with("rfc2543-"));
    }

    #[test]
    fn legacy_branch_distinguishes_different_requests() {
        let a = TransactionKey::from_request(&request(Method::Invite, Some("old-style-1"))).unwrap();
        let mut other = request(Method::Invite, Some("old-style-1"));
        other.set_header(Header::text(HeaderName::CallId, "different-call"));
        let b = TransactionKey::from_request(&other).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn response_key_takes_method_from_cseq() {
        let req = request(Method::Invite, Some("z9hG4bK-abc"));
        let resp = ResponseBuilder::from_request(StatusCode::OK, &req).build();
        let key = TransactionKey::from_response(&resp).unwrap();
        assert_eq!(key, TransactionKey::client("z9hG4bK-abc", Method::Invite));
    }

    #[test]
    fn missing_via_is_underivable() {
        let req = RequestBuilder::new(Method::Invite, "sip:a@b").unwrap().build();
        assert!(TransactionKey::from_request(&req).is_err());
    }
}
