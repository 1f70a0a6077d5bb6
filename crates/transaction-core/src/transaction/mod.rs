//! The transaction layer's vocabulary: kinds, keys, states, events and
//! the per-kind state machine implementations.
//!
//! Each live transaction is one tokio task running the generic event loop
//! in [`runner`], parameterized by a [`logic::TransactionLogic`]
//! implementation — one per RFC 3261 Section 17 state machine variant
//! (client/server × INVITE/non-INVITE) under [`client`] and [`server`].

pub mod client;
pub mod key;
pub mod logic;
pub mod runner;
pub mod server;
pub mod state;
pub mod timer;
pub mod validators;

pub use key::{TransactionKey, TransactionRole};
pub use state::{AtomicTransactionState, TransactionState};
pub use timer::TimerSettings;

use sipflow_sip_core::{Message, Request, Response};
use sipflow_sip_transport::Destination;

/// Mailbox depth per transaction. Events per transaction are few (a
/// handful of responses and timers), so a small buffer suffices.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// The four RFC 3261 Section 17 state machine variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// INVITE client transaction (Section 17.1.1).
    InviteClient,
    /// Non-INVITE client transaction (Section 17.1.2).
    NonInviteClient,
    /// INVITE server transaction (Section 17.2.1).
    InviteServer,
    /// Non-INVITE server transaction (Section 17.2.2).
    NonInviteServer,
}

impl TransactionKind {
    /// The variant serving `method` on the given side.
    pub fn for_method(method: &sipflow_sip_core::Method, server: bool) -> TransactionKind {
        match (method.for_server_matching().is_invite(), server) {
            (true, true) => TransactionKind::InviteServer,
            (true, false) => TransactionKind::InviteClient,
            (false, true) => TransactionKind::NonInviteServer,
            (false, false) => TransactionKind::NonInviteClient,
        }
    }

    /// True for the two server-side variants.
    pub fn is_server(&self) -> bool {
        matches!(self, TransactionKind::InviteServer | TransactionKind::NonInviteServer)
    }
}

/// Commands processed by a transaction's event loop.
///
/// Everything that happens to a transaction — messages routed to it, TU
/// sends, timer expiries, transport failures — arrives through its mailbox
/// as one of these, which serializes all event sources onto the
/// transaction's own task.
#[derive(Debug)]
pub enum InternalTransactionCommand {
    /// Move to a new state (validated against the FSM diagram).
    TransitionTo(TransactionState),
    /// Process a message routed to this transaction.
    ProcessMessage(Message),
    /// The TU wants this response sent (server transactions only).
    SendResponse(Response),
    /// A named timer fired.
    Timer(&'static str),
    /// The transport reported a fatal send failure.
    TransportError,
    /// Shut the transaction down (manager shutdown path).
    Terminate,
}

/// Events the transaction layer reports to the Transaction User.
///
/// Every transaction produces exactly one terminal outcome — a final
/// response event, `TransactionTimeout`, or `TransportError` — followed by
/// `TransactionTerminated` when its task unwinds.
#[derive(Debug)]
pub enum TransactionEvent {
    /// A state transition happened.
    StateChanged {
        /// The transaction.
        key: TransactionKey,
        /// State before.
        previous: TransactionState,
        /// State after.
        current: TransactionState,
    },
    /// A provisional (1xx) response arrived for a client transaction.
    ProvisionalResponse {
        /// The transaction.
        key: TransactionKey,
        /// The response.
        response: Response,
    },
    /// A 2xx final response arrived for a client transaction.
    SuccessResponse {
        /// The transaction.
        key: TransactionKey,
        /// The response.
        response: Response,
    },
    /// A 300-699 final response arrived for a client transaction (the ACK
    /// for an INVITE was already generated and sent by the transaction).
    FailureResponse {
        /// The transaction.
        key: TransactionKey,
        /// The response.
        response: Response,
    },
    /// An ACK reached an INVITE server transaction in Completed.
    AckReceived {
        /// The transaction.
        key: TransactionKey,
        /// The ACK request.
        request: Request,
    },
    /// A CANCEL matched a live INVITE server transaction. The CANCEL forms
    /// its own server transaction; this event tells the TU which INVITE it
    /// targets.
    CancelReceived {
        /// The INVITE server transaction being cancelled.
        key: TransactionKey,
        /// The CANCEL request.
        request: Request,
    },
    /// A request arrived that matches no transaction; the TU decides
    /// whether to create a server transaction for it.
    NewRequest {
        /// The request.
        request: Request,
        /// Where it came from.
        source: Destination,
    },
    /// An ACK that matches no transaction (ACK to a 2xx is end-to-end and
    /// belongs to the dialog layer).
    StrayAck {
        /// The ACK request.
        request: Request,
        /// Where it came from.
        source: Destination,
    },
    /// A response that matches no client transaction. Dropped after this
    /// notification (RFC 3261 Section 18.1.2 leaves this to the TU).
    StrayResponse {
        /// The response.
        response: Response,
    },
    /// A timer fired (diagnostic).
    TimerTriggered {
        /// The transaction.
        key: TransactionKey,
        /// Timer name (A, B, D, E, F, G, H, I, J, K, 100).
        timer: &'static str,
    },
    /// Timer B/F/H expired: no final response in 64·T1. Terminal.
    TransactionTimeout {
        /// The transaction.
        key: TransactionKey,
    },
    /// The transport failed underneath the transaction. Terminal, with
    /// timeout semantics for the TU.
    TransportError {
        /// The transaction.
        key: TransactionKey,
    },
    /// The transaction reached Terminated and its task is gone; the
    /// manager has already dropped it from the registry.
    TransactionTerminated {
        /// The transaction.
        key: TransactionKey,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::Method;

    #[test]
    fn kind_for_method() {
        assert_eq!(
            TransactionKind::for_method(&Method::Invite, true),
            TransactionKind::InviteServer
        );
        assert_eq!(
            TransactionKind::for_method(&Method::Invite, false),
            TransactionKind::InviteClient
        );
        // ACK normalizes to the INVITE machinery.
        assert_eq!(
            TransactionKind::for_method(&Method::Ack, true),
            TransactionKind::InviteServer
        );
        assert_eq!(
            TransactionKind::for_method(&Method::Options, true),
            TransactionKind::NonInviteServer
        );
        assert_eq!(
            TransactionKind::for_method(&Method::Cancel, false),
            TransactionKind::NonInviteClient
        );
    }
}
