//! The generic transaction event loop.
//!
//! One instance of [`run_transaction_loop`] runs per live transaction, on
//! its own tokio task, consuming [`InternalTransactionCommand`]s from the
//! transaction's mailbox in arrival order. It owns the state transitions
//! (validated against the RFC 3261 Section 17 diagram for the variant),
//! cancels pending timers on every transition, and reports state changes
//! and errors to the Transaction User.
//!
//! Variant behavior is injected through
//! [`crate::transaction::logic::TransactionLogic`]; the loop itself never
//! inspects messages.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::transaction::logic::TransactionLogic;
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TransactionEvent, TransactionKey,
    TransactionState,
};

/// Access to the transaction's state cell.
pub trait AsRefState {
    /// The shared state storage.
    fn as_ref_state(&self) -> &Arc<AtomicTransactionState>;
}

/// Access to the transaction's key.
pub trait AsRefKey {
    /// The transaction's registry key.
    fn as_ref_key(&self) -> &TransactionKey;
}

/// Access to the TU event channel.
pub trait HasTransactionEvents {
    /// Sender for TU notifications.
    fn event_sender(&self) -> mpsc::Sender<TransactionEvent>;
}

/// Access to the transaction's own mailbox (for self-commands from timers
/// and state handlers).
pub trait HasCommandSender {
    /// Sender for the transaction's own mailbox.
    fn command_sender(&self) -> mpsc::Sender<InternalTransactionCommand>;
}

/// Runs a transaction to completion.
///
/// The loop exits when the state reaches `Terminated` (by transition,
/// transport error, or an explicit `Terminate` command) or when the
/// mailbox closes. On exit, every pending timer is cancelled and
/// [`TransactionEvent::TransactionTerminated`] is emitted so the manager
/// unregisters the key — the single owner responsible for reaping.
pub async fn run_transaction_loop<D, TH, L>(
    data: Arc<D>,
    logic: Arc<L>,
    mut cmd_rx: mpsc::Receiver<InternalTransactionCommand>,
) where
    D: AsRefState + AsRefKey + HasTransactionEvents + HasCommandSender + Send + Sync + 'static,
    TH: Default + Send + 'static,
    L: TransactionLogic<D, TH> + Send + Sync + 'static,
{
    let mut timer_handles = TH::default();
    let key = data.as_ref_key().clone();
    debug!(id = %key, kind = ?logic.kind(), "Transaction loop starting");

    while let Some(command) = cmd_rx.recv().await {
        let current_state = data.as_ref_state().get();

        match command {
            InternalTransactionCommand::TransitionTo(new_state) => {
                if current_state == new_state {
                    trace!(id = %key, state = ?current_state, "Already in requested state");
                    continue;
                }
                if let Err(e) =
                    AtomicTransactionState::validate_transition(logic.kind(), current_state, new_state)
                {
                    error!(id = %key, error = %e, "Rejected state transition");
                    continue;
                }

                logic.cancel_all_timers(&mut timer_handles);
                let previous = data.as_ref_state().set(new_state);
                debug!(id = %key, ?previous, current = ?new_state, "State changed");

                let _ = data
                    .event_sender()
                    .send(TransactionEvent::StateChanged {
                        key: key.clone(),
                        previous,
                        current: new_state,
                    })
                    .await;

                if let Err(e) = logic
                    .on_enter_state(&data, new_state, previous, &mut timer_handles, data.command_sender())
                    .await
                {
                    error!(id = %key, error = %e, state = ?new_state, "Error entering state");
                }
            }
            InternalTransactionCommand::ProcessMessage(message) => {
                match logic
                    .process_message(&data, message, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next)) => self_transition(&data, &key, next).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %key, error = %e, state = ?current_state, "Error processing message");
                    }
                }
            }
            InternalTransactionCommand::SendResponse(response) => {
                match logic
                    .send_response(&data, response, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next)) => self_transition(&data, &key, next).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %key, error = %e, state = ?current_state, "Error sending response");
                    }
                }
            }
            InternalTransactionCommand::Timer(timer) => {
                let _ = data
                    .event_sender()
                    .send(TransactionEvent::TimerTriggered {
                        key: key.clone(),
                        timer,
                    })
                    .await;
                match logic
                    .handle_timer(&data, timer, current_state, &mut timer_handles)
                    .await
                {
                    Ok(Some(next)) => self_transition(&data, &key, next).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(id = %key, error = %e, timer, "Error handling timer");
                    }
                }
            }
            InternalTransactionCommand::TransportError => {
                error!(id = %key, "Transport error; terminating transaction");
                let _ = data
                    .event_sender()
                    .send(TransactionEvent::TransportError { key: key.clone() })
                    .await;
                logic.cancel_all_timers(&mut timer_handles);
                data.as_ref_state().set(TransactionState::Terminated);
                break;
            }
            InternalTransactionCommand::Terminate => {
                debug!(id = %key, "Terminate command received");
                logic.cancel_all_timers(&mut timer_handles);
                data.as_ref_state().set(TransactionState::Terminated);
                break;
            }
        }

        if data.as_ref_state().get() == TransactionState::Terminated {
            break;
        }
    }

    logic.cancel_all_timers(&mut timer_handles);
    data.as_ref_state().set(TransactionState::Terminated);
    debug!(id = %key, "Transaction loop ended");

    // The manager listens for this to drop the registry entry; failure
    // here only means the whole layer is shutting down.
    let _ = data
        .event_sender()
        .send(TransactionEvent::TransactionTerminated { key })
        .await;
}

async fn self_transition<D>(data: &Arc<D>, key: &TransactionKey, next: TransactionState)
where
    D: HasCommandSender,
{
    if let Err(e) = data
        .command_sender()
        .send(InternalTransactionCommand::TransitionTo(next))
        .await
    {
        error!(id = %key, error = %e, "Failed to queue state transition");
    }
}
