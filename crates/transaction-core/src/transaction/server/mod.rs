//! Server transactions (RFC 3261 Section 17.2).
//!
//! Both server variants share [`ServerTransactionData`]; the variant
//! behavior lives in [`invite`] and [`non_invite`]. Responses retrace the
//! request's path: the reply destination is fixed at creation from the top
//! Via per Section 18.2.2.

pub mod invite;
pub mod non_invite;

pub use invite::ServerInviteTransaction;
pub use non_invite::ServerNonInviteTransaction;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use sipflow_sip_core::{Message, Request, Response};
use sipflow_sip_transport::{response_destination, Destination, Transport};

use crate::transaction::runner::{AsRefKey, AsRefState, HasCommandSender, HasTransactionEvents};
use crate::transaction::{
    AtomicTransactionState, InternalTransactionCommand, TimerSettings, TransactionEvent,
    TransactionKey, TransactionState,
};

/// State shared by both server transaction variants.
#[derive(Debug)]
pub struct ServerTransactionData {
    /// Registry key (branch + method + sent-by, server side).
    pub key: TransactionKey,
    /// Current FSM state.
    pub state: Arc<AtomicTransactionState>,
    /// The request that created this transaction.
    pub request: Mutex<Request>,
    /// Last response sent; retransmitted requests get it again, and the
    /// retransmission timers resend it.
    pub last_response: Mutex<Option<Response>>,
    /// Where responses go (top Via `received`/sent-by, Section 18.2.2).
    pub reply_to: Destination,
    /// Whether the transport is reliable; gates Timer G and zeroes the
    /// linger waits (I, J).
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

impl Drop for ServerTransactionData {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                debug!(id = %self.key, "Server transaction data dropped; aborting loop");
                task.abort();
            }
        }
    }
}

impl ServerTransactionData {
    /// Sends a response toward the reply destination. On transport failure
    /// the transaction queues `TransportError` for itself.
    pub(crate) async fn transmit_response(&self, response: Response) {
        if let Err(e) = self
            .transport
            .send_message(Message::Response(response), self.reply_to)
            .await
        {
            error!(id = %self.key, error = %e, "Failed to send response");
            let _ = self.cmd_tx.send(InternalTransactionCommand::TransportError).await;
        }
    }

    /// Re-sends the stored response, if one exists. Used both for request
    /// retransmissions and for the G-timer retransmit schedule.
    pub(crate) async fn retransmit_last_response(&self) {
        let response = self.last_response.lock().await.clone();
        if let Some(response) = response {
            self.transmit_response(response).await;
        }
    }
}

impl AsRefState for ServerTransactionData {
    fn as_ref_state(&self) -> &Arc<AtomicTransactionState> {
        &self.state
    }
}

impl AsRefKey for ServerTransactionData {
    fn as_ref_key(&self) -> &TransactionKey {
        &self.key
    }
}

impl HasTransactionEvents for ServerTransactionData {
    fn event_sender(&self) -> mpsc::Sender<TransactionEvent> {
        self.events_tx.clone()
    }
}

impl HasCommandSender for ServerTransactionData {
    fn command_sender(&self) -> mpsc::Sender<InternalTransactionCommand> {
        self.cmd_tx.clone()
    }
}

/// Constructor arguments shared by both server variants.
pub(crate) struct ServerTransactionParams {
    pub key: TransactionKey,
    pub request: Request,
    pub source: Destination,
    pub transport: Arc<dyn Transport>,
    pub events_tx: mpsc::Sender<TransactionEvent>,
    pub timers: TimerSettings,
}

impl ServerTransactionParams {
    pub(crate) fn into_data(
        self,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Arc<ServerTransactionData> {
        let reply_to = response_destination(&self.request, self.source);
        let reliable = reply_to.kind.is_reliable();
        Arc::new(ServerTransactionData {
            key: self.key,
            state: Arc::new(AtomicTransactionState::new(TransactionState::Initial)),
            request: Mutex::new(self.request),
            last_response: Mutex::new(None),
            reply_to,
            reliable,
            transport: self.transport,
            events_tx: self.events_tx,
            cmd_tx,
            timers: self.timers,
            task: std::sync::Mutex::new(None),
        })
    }
}
