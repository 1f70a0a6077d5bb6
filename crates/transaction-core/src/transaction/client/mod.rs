//! Client transactions (RFC 3261 Section 17.1).
//!
//! Both client variants share [`ClientTransactionData`]; the variant
//! behavior lives in [`invite`] and [`non_invite`].

pub mod invite;
pub mod non_invite;

pub use invite::ClientInviteTransaction;
pub use non_invite::ClientNonInviteTransaction;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use sipflow_sip_core::{Message, Request, Response};
use sipflow_sip_transport::{Destination, Transport};

use crate::transaction::runner::{AsRefKey, AsRefState, HasCommandSender, HasTransactionEvents};
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TimerSettings, TransactionEvent,
    TransactionKey,
};

/// State shared by both client transaction variants.
#[derive(Debug)]
pub struct ClientTransactionData {
    /// Registry key (branch + method, client side).
    pub key: TransactionKey,
    /// Current FSM state.
    pub state: Arc<AtomicTransactionState>,
    /// The request this transaction is sending (retransmissions clone it).
    pub request: Mutex<Request>,
    /// Most recent response received, for the TU to query.
    pub last_response: Mutex<Option<Response>>,
    /// Where the request goes (supplied by the UAC, Section 8.1.2).
    pub destination: Destination,
    /// Whether the transport is reliable; gates timers A/E and zeroes the
    /// linger waits.
    pub reliable: bool,
    /// Transport used for all sends.
    pub transport: Arc<dyn Transport>,
    /// TU notification channel.
    pub events_tx: mpsc::Sender<TransactionEvent>,
    /// The transaction's own mailbox.
    pub cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    /// Timer durations.
    pub timers: TimerSettings,
    /// The event-loop task, aborted if the transaction is dropped early.
    pub(crate) task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientTransactionData {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                debug!(id = %self.key, "Client transaction data dropped; aborting loop");
                task.abort();
            }
        }
    }
}

impl ClientTransactionData {
    /// Sends (or retransmits) the transaction's request. On transport
    /// failure the transaction queues `TransportError` for itself, which
    /// terminates it with timeout semantics toward the TU.
    pub(crate) async fn transmit_request(&self) {
        let request = self.request.lock().await.clone();
        if let Err(e) = self
            .transport
            .send_message(Message::Request(request), self.destination)
            .await
        {
            error!(id = %self.key, error = %e, "Failed to send request");
            let _ = self.cmd_tx.send(InternalTransactionCommand::TransportError).await;
        }
    }
}

impl AsRefState for ClientTransactionData {
    fn as_ref_state(&self) -> &Arc<AtomicTransactionState> {
        &self.state
    }
}

impl AsRefKey for ClientTransactionData {
    fn as_ref_key(&self) -> &TransactionKey {
        &self.key
    }
}

impl HasTransactionEvents for ClientTransactionData {
    fn event_sender(&self) -> mpsc::Sender<TransactionEvent> {
        self.events_tx.clone()
    }
}

impl HasCommandSender for ClientTransactionData {
    fn command_sender(&self) -> mpsc::Sender<InternalTransactionCommand> {
        self.cmd_tx.clone()
    }
}

/// Constructor arguments shared by both client variants.
pub(crate) struct ClientTransactionParams {
    pub key: TransactionKey,
    pub request: Request,
    pub destination: Destination,
    pub transport: Arc<dyn Transport>,
    pub events_tx: mpsc::Sender<TransactionEvent>,
    pub timers: TimerSettings,
}

impl ClientTransactionParams {
    pub(crate) fn into_data(
        self,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Arc<ClientTransactionData> {
        let reliable = self.transport.is_reliable();
        Arc::new(ClientTransactionData {
            key: self.key,
            state: Arc::new(AtomicTransactionState::new(
                crate::transaction::TransactionState::Initial,
            )),
            request: Mutex::new(self.request),
            last_response: Mutex::new(None),
            destination: self.destination,
            reliable,
            transport: self.transport,
            events_tx: self.events_tx,
            cmd_tx,
            timers: self.timers,
            task: std::sync::Mutex::new(None),
        })
    }
}
