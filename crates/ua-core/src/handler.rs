//! The capability set a UA core implements.
//!
//! A core is the Transaction User for some slice of incoming traffic: it
//! declares which messages it takes (`is_applicable`), which methods and
//! extensions it supports (driving the automatic 405/420 rejections), and
//! handles the requests that survive validation. State a core needs
//! across requests lives in the implementing type itself.

use std::sync::Arc;

use async_trait::async_trait;

use sipflow_sip_core::{Message, Method, Request, Response};
use sipflow_transaction_core::{TransactionEvent, TransactionKey, TransactionManager};

/// What a core does with a validated request.
#[derive(Debug)]
pub enum CoreAction {
    /// Send this response through the server transaction.
    Reply(Response),
    /// The core will respond later (or never — e.g. it forwarded the
    /// request elsewhere).
    Noreply,
}

/// Ambient context for a request dispatch: the manager (for sending
/// further requests or late responses) and the server transaction the
/// request arrived on.
#[derive(Clone)]
pub struct CoreContext {
    /// The transaction layer.
    pub manager: Arc<TransactionManager>,
    /// The server transaction carrying this request; `None` for ACKs,
    /// which arrive without a transaction.
    pub transaction: Option<TransactionKey>,
}

/// A User-Agent core: predicate, capabilities and request handling.
#[async_trait]
pub trait UserAgentCore: Send + Sync {
    /// Whether this core takes the message. The registry asks cores in
    /// registration order; the first `true` wins.
    fn is_applicable(&self, message: &Message) -> bool;

    /// Methods this core serves. Requests outside the set are rejected
    /// with 405 and an `Allow` header built from this same list. ACK and
    /// CANCEL are implicitly allowed and need not be listed.
    fn allowed_methods(&self) -> Vec<Method>;

    /// Extension tags this core supports; `Require` values outside the
    /// list draw a 420 with the offenders in `Unsupported`.
    fn supported_extensions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether merged-request (loop) detection per RFC 3261 Section
    /// 8.2.2.2 runs for this core's requests.
    fn detect_loops(&self) -> bool {
        true
    }

    /// Value for the auto-populated `Server` header, when any.
    fn server_header(&self) -> Option<String> {
        None
    }

    /// Handles a request that passed validation. ACKs to 2xx arrive here
    /// too (with `ctx.transaction` unset); replies to them are ignored.
    async fn on_request(&self, ctx: &CoreContext, request: &Request) -> CoreAction;

    /// Observes transaction-layer events touching this core's traffic
    /// (timeouts, transport errors, terminations). Default: ignore.
    async fn on_transaction_event(&self, _event: &TransactionEvent) {}
}
