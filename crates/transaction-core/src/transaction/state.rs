//! Transaction states and thread-safe state storage.
//!
//! RFC 3261 Section 17 defines four state machines (INVITE/non-INVITE ×
//! client/server). They share a state vocabulary; which states apply and
//! which transitions are legal depends on the [`TransactionKind`].
//! Transitions are monotonic along each diagram and `Terminated` is
//! absorbing.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::transaction::TransactionKind;

/// The state of a SIP transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Before the first event: a client transaction that has not sent yet,
    /// a server transaction not yet fed its request. Not named in the RFC
    /// diagrams but needed as the spawn state.
    Initial,
    /// Client INVITE only: request sent, no response yet (17.1.1.2).
    Calling,
    /// Non-INVITE (both roles): request sent / received, no provisional
    /// or final activity yet (17.1.2.2, 17.2.2).
    Trying,
    /// A provisional response was received (client) or sent (server).
    Proceeding,
    /// A final response was received (client) or sent (server); the
    /// transaction lingers to absorb retransmissions.
    Completed,
    /// Server INVITE only: ACK received for a non-2xx final (17.2.1).
    Confirmed,
    /// Absorbing final state; the transaction is reaped.
    Terminated,
}

impl TransactionState {
    /// True for the absorbing final state.
    pub fn is_terminated(&self) -> bool {
        *self == TransactionState::Terminated
    }
}

/// Thread-safe holder for a [`TransactionState`].
///
/// The state is read by the manager and the TU while the transaction's own
/// task writes it, so it lives in an `AtomicU8`.
#[derive(Debug)]
pub struct AtomicTransactionState {
    value: AtomicU8,
}

impl AtomicTransactionState {
    /// Creates storage initialized to `state`.
    pub fn new(state: TransactionState) -> AtomicTransactionState {
        AtomicTransactionState {
            value: AtomicU8::new(encode(state)),
        }
    }

    /// The current state.
    pub fn get(&self) -> TransactionState {
        decode(self.value.load(Ordering::Acquire))
    }

    /// Stores `new_state`, returning the previous state.
    pub fn set(&self, new_state: TransactionState) -> TransactionState {
        decode(self.value.swap(encode(new_state), Ordering::AcqRel))
    }

    /// Checks a transition against the state machine diagram for `kind`.
    ///
    /// Self-transitions are no-ops and always legal; any state may move to
    /// `Terminated` (transport errors and shutdown can strike anywhere);
    /// nothing leaves `Terminated`.
    pub fn validate_transition(
        kind: TransactionKind,
        from: TransactionState,
        to: TransactionState,
    ) -> std::result::Result<(), crate::error::Error> {
        use TransactionState::*;

        if from == to {
            return Ok(());
        }
        if from == Terminated {
            return Err(invalid(kind, from, to));
        }
        if to == Terminated {
            return Ok(());
        }

        let ok = match kind {
            TransactionKind::InviteClient => matches!(
                (from, to),
                (Initial, Calling) | (Calling, Proceeding) | (Calling, Completed) | (Proceeding, Completed)
            ),
            TransactionKind::NonInviteClient => matches!(
                (from, to),
                (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
            ),
            TransactionKind::InviteServer => matches!(
                (from, to),
                (Initial, Proceeding)
                    | (Initial, Completed)
                    | (Proceeding, Completed)
                    | (Completed, Confirmed)
            ),
            TransactionKind::NonInviteServer => matches!(
                (from, to),
                (Initial, Trying) | (Trying, Proceeding) | (Trying, Completed) | (Proceeding, Completed)
            ),
        };

        if ok {
            Ok(())
        } else {
            Err(invalid(kind, from, to))
        }
    }
}

fn invalid(kind: TransactionKind, from: TransactionState, to: TransactionState) -> crate::error::Error {
    crate::error::Error::InvalidStateTransition { kind, from, to }
}

fn encode(state: TransactionState) -> u8 {
    match state {
        TransactionState::Initial => 0,
        TransactionState::Calling => 1,
        TransactionState::Trying => 2,
        TransactionState::Proceeding => 3,
        TransactionState::Completed => 4,
        TransactionState::Confirmed => 5,
        TransactionState::Terminated => 6,
    }
}

fn decode(value: u8) -> TransactionState {
    match value {
        0 => TransactionState::Initial,
        1 => TransactionState::Calling,
        2 => TransactionState::Trying,
        3 => TransactionState::Proceeding,
        4 => TransactionState::Completed,
        5 => TransactionState::Confirmed,
        _ => TransactionState::Terminated,
    }
}
