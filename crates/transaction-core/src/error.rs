use thiserror::Error;

use crate::transaction::{TransactionKey, TransactionKind, TransactionState};

/// A type alias for handling `Result`s within the transaction layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transaction layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A transaction with the same key is already registered. Creation is
    /// aborted; the caller decides whether to drop the message or treat it
    /// as a retransmission.
    #[error("Transaction already exists: {0}")]
    Duplicate(TransactionKey),

    /// No transaction matches the key.
    #[error("Transaction not found: {0}")]
    NotFound(TransactionKey),

    /// The message lacked the headers needed to derive a transaction key
    /// (top Via with branch, CSeq on responses).
    #[error("Cannot derive transaction key: {0}")]
    KeyUnderivable(String),

    /// A state transition outside the FSM diagram was requested.
    #[error("Invalid {kind:?} transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        /// The state machine variant.
        kind: TransactionKind,
        /// Transition origin.
        from: TransactionState,
        /// Requested target.
        to: TransactionState,
    },

    /// The transport refused a send. Fatal for the transaction; the TU
    /// observes timeout semantics.
    #[error("Transport error: {0}")]
    Transport(#[from] sipflow_sip_transport::Error),

    /// Codec failure while deriving a message (ACK, CANCEL, response).
    #[error("Codec error: {0}")]
    Codec(#[from] sipflow_sip_core::Error),

    /// The transaction's mailbox is gone (task terminated).
    #[error("Transaction mailbox closed: {0}")]
    MailboxClosed(TransactionKey),

    /// A request was made in a state that does not allow it.
    #[error("{0}")]
    InvalidOperation(String),
}
