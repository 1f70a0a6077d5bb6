//! Response-to-transaction validation for client transactions.
//!
//! The router already matched on the derived key, but RFC 3261 Section
//! 17.1.3 requires the branch and CSeq method checks to hold against the
//! transaction's own records — in particular to keep a CANCEL's responses
//! out of the INVITE transaction that shares its branch.

use tracing::warn;

use sipflow_sip_core::message::HeaderCarrier;
use sipflow_sip_core::{Message, Method, Response};

use crate::error::{Error, Result};
use crate::transaction::TransactionKey;

/// Checks that `response` belongs to the transaction: top Via branch must
/// equal the transaction's branch and the CSeq method must equal the
/// original request's method.
pub fn validate_response_matches(
    response: &Response,
    key: &TransactionKey,
    original_method: &Method,
) -> Result<()> {
    let via = response
        .top_via()
        .map_err(Error::Codec)?
        .ok_or_else(|| Error::InvalidOperation("response without Via".to_string()))?;
    match via.branch() {
        Some(branch) if branch == key.branch => {}
        received => {
            warn!(id = %key, ?received, "Response branch does not match transaction");
            return Err(Error::InvalidOperation("mismatched Via branch".to_string()));
        }
    }

    let cseq = response
        .cseq()
        .map_err(Error::Codec)?
        .ok_or_else(|| Error::InvalidOperation("response without CSeq".to_string()))?;
    if cseq.method != *original_method {
        warn!(id = %key, received = %cseq.method, expected = %original_method, "Response CSeq method mismatch");
        return Err(Error::InvalidOperation("mismatched CSeq method".to_string()));
    }

    Ok(())
}

/// Extracts the response from a message routed to a client transaction;
/// requests are a routing error and are dropped.
pub fn extract_response(message: Message, key: &TransactionKey) -> Result<Response> {
    match message {
        Message::Response(response) => Ok(response),
        Message::Request(_) => {
            warn!(id = %key, "Client transaction received a request; ignoring");
            Err(Error::InvalidOperation(
                "client transaction received a request".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::prelude::*;

    fn response(branch: &str, cseq_method: Method) -> Response {
        let req = RequestBuilder::new(cseq_method.clone(), "sip:x@y")
            .unwrap()
            .via("client.example.com", None, "UDP", Some(branch))
            .cseq(3)
            .build();
        ResponseBuilder::from_request(StatusCode::OK, &req).build()
    }

    #[test]
    fn matching_response_passes() {
        let key = TransactionKey::client("z9hG4bK-m", Method::Options);
        let resp = response("z9hG4bK-m", Method::Options);
        assert!(validate_response_matches(&resp, &key, &Method::Options).is_ok());
    }

    #[test]
    fn branch_mismatch_fails() {
        let key = TransactionKey::client("z9hG4bK-m", Method::Options);
        let resp = response("z9hG4bK-other", Method::Options);
        assert!(validate_response_matches(&resp, &key, &Method::Options).is_err());
    }

    #[test]
    fn cancel_responses_stay_out_of_invite_transactions() {
        let key = TransactionKey::client("z9hG4bK-m", Method::Invite);
        let resp = response("z9hG4bK-m", Method::Cancel);
        assert!(validate_response_matches(&resp, &key, &Method::Invite).is_err());
    }

    #[test]
    fn requests_are_rejected() {
        let key = TransactionKey::client("z9hG4bK-m", Method::Invite);
        let req = RequestBuilder::new(Method::Invite, "sip:x@y").unwrap().build();
        assert!(extract_response(Message::Request(req), &key).is_err());
    }
}
