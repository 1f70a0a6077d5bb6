//! # sipflow-transaction-core
//!
//! The RFC 3261 transaction layer: the four Section 17 state machines,
//! the process-wide transaction registry with its uniqueness invariant,
//! and the router that binds a pluggable transport to the Transaction
//! User above.
//!
//! ## Architecture
//!
//! - One tokio task per live transaction, driven by a typed command
//!   mailbox ([`transaction::InternalTransactionCommand`]); the generic
//!   event loop lives in [`transaction::runner`], the per-variant
//!   behavior behind [`transaction::logic::TransactionLogic`].
//! - The [`manager::TransactionManager`] owns the registry
//!   (`TransactionKey -> handle`, at most one entry per key), the
//!   RFC 3261 Section 8.2.2.2 loop-detection index, and two pump tasks:
//!   transport events in, transaction events out (reaping terminated
//!   transactions on the way).
//! - The TU observes the layer exclusively through
//!   [`transaction::TransactionEvent`]s: per transaction, exactly one
//!   terminal outcome (final response, timeout, or transport error)
//!   followed by `TransactionTerminated`.
//!
//! Timers follow Section 17 throughout: T1 = 500 ms, T2 = 4 s, T4 = 5 s,
//! transaction timeout 64·T1; retransmission timers (A, E, G) and linger
//! waits (D, I, J, K) are suppressed or zeroed over reliable transports.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod manager;
pub mod transaction;
pub mod utils;

pub use error::{Error, Result};
pub use manager::TransactionManager;
pub use transaction::{
    AtomicTransactionState, TimerSettings, TransactionEvent, TransactionKey, TransactionKind,
    TransactionRole, TransactionState,
};

/// Common imports for transaction layer users.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::manager::TransactionManager;
    pub use crate::transaction::client::{ClientInviteTransaction, ClientNonInviteTransaction};
    pub use crate::transaction::server::{ServerInviteTransaction, ServerNonInviteTransaction};
    pub use crate::transaction::{
        TimerSettings, TransactionEvent, TransactionKey, TransactionKind, TransactionRole,
        TransactionState,
    };
    pub use crate::utils::{create_ack_from_invite, create_cancel, create_response, generate_branch, generate_tag};
}
