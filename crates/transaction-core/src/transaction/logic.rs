//! The per-kind state machine trait.
//!
//! The generic event loop in [`crate::transaction::runner`] is identical
//! for all four RFC 3261 transaction variants; everything
//! variant-specific — which timers arm on state entry, how messages and
//! timer expiries drive transitions — lives behind this trait. `D` is the
//! shared transaction data (client or server flavor) and `TH` the struct
//! of timer `JoinHandle`s the variant owns.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sipflow_sip_core::{Message, Response};

use crate::error::Result;
use crate::transaction::{InternalTransactionCommand, TransactionKind, TransactionState};

/// Behavior of one transaction state machine variant.
#[async_trait]
pub trait TransactionLogic<D, TH>: Send + Sync
where
    TH: Default + Send,
{
    /// Which of the four variants this is.
    fn kind(&self) -> TransactionKind;

    /// Aborts every pending timer. Called on each state change and on
    /// loop exit, so a variant never carries timers across states.
    fn cancel_all_timers(&self, timer_handles: &mut TH);

    /// Arms timers and performs sends required on entering `new_state`.
    async fn on_enter_state(
        &self,
        data: &Arc<D>,
        new_state: TransactionState,
        previous_state: TransactionState,
        timer_handles: &mut TH,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()>;

    /// Reacts to a named timer in the current state. Returns the state to
    /// move to, if any.
    async fn handle_timer(
        &self,
        data: &Arc<D>,
        timer: &'static str,
        current_state: TransactionState,
        timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>>;

    /// Processes a message routed to this transaction (responses for
    /// client variants, request retransmissions/ACK for server variants).
    async fn process_message(
        &self,
        data: &Arc<D>,
        message: Message,
        current_state: TransactionState,
        timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>>;

    /// Sends a TU-supplied response (server variants). Client variants
    /// keep the default, which rejects the command.
    async fn send_response(
        &self,
        _data: &Arc<D>,
        _response: Response,
        _current_state: TransactionState,
        _timer_handles: &mut TH,
    ) -> Result<Option<TransactionState>> {
        Err(crate::error::Error::InvalidOperation(
            "client transactions do not send responses".to_string(),
        ))
    }
}
