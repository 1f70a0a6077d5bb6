//! INVITE server transaction (RFC 3261 Section 17.2.1).
//!
//! ```text
//!       INVITE received
//!            V
//!      +------------+  2xx sent   +------------+
//!      | Proceeding |-----------> | Terminated |
//!      +------------+             +------------+
//!            | 300-699 sent             ^  ^
//!            V                          |  |
//!      +-----------+   Timer H ---------+  |
//!      | Completed |                       |
//!      +-----------+                       |
//!            | ACK received                |
//!            V                             |
//!      +-----------+   Timer I ------------+
//!      | Confirmed |
//!      +-----------+
//! ```
//!
//! The transaction answers `100 Trying` on the TU's behalf if no response
//! has been produced within a short grace period (the optional "Timer 100"
//! from Section 17.2.1). A non-2xx final is retransmitted on Timer G until
//! the ACK arrives or Timer H declares the ACK lost; a 2xx terminates the
//! transaction immediately — its retransmission and ACK are end-to-end TU
//! concerns (Section 13.3.1.4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipflow_sip_core::{Message, Method, Request, Response, StatusCode};
use sipflow_sip_transport::{Destination, Transport};

use crate::error::{Error, Result};
use crate::transaction::COMMAND_CHANNEL_CAPACITY;
use crate::transaction::logic::TransactionLogic;
use crate::transaction::runner::run_transaction_loop;
use crate::transaction::server::{ServerTransactionData, ServerTransactionParams};
use crate::transaction::timer::start_timer;
use crate::transaction::{
    InternalTransactionCommand, TimerSettings, TransactionEvent, TransactionKey, TransactionKind,
    TransactionState,
};
use crate::utils;

/// Handles for the INVITE server timers (the provisional "100" grace
/// timer, G, H, I).
#[derive(Debug, Default)]
struct InviteServerTimers {
    timer_100: Option<JoinHandle<()>>,
    timer_g: Option<JoinHandle<()>>,
    /// Current Timer G interval; doubles to the T2 cap.
    timer_g_interval: Option<Duration>,
    timer_h: Option<JoinHandle<()>>,
    timer_i: Option<JoinHandle<()>>,
}

/// The Section 17.2.1 state machine.
#[derive(Debug, Default)]
struct InviteServerLogic;

#[async_trait]
impl TransactionLogic<ServerTransactionData, InviteServerTimers> for InviteServerLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteServer
    }

    fn cancel_all_timers(&self, timers: &mut InviteServerTimers) {
        for handle in [
            timers.timer_100.take(),
            timers.timer_g.take(),
            timers.timer_h.take(),
            timers.timer_i.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        timers.timer_g_interval = None;
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ServerTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timers: &mut InviteServerTimers,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()> {
        match new_state {
            TransactionState::Proceeding => {
                // If the TU stays silent, answer 100 Trying ourselves.
                timers.timer_100 = Some(start_timer(&data.key, "100", data.timers.timer_100_interval, cmd_tx));
            }
            TransactionState::Completed => {
                if !data.reliable {
                    let interval = data.timers.t1;
                    timers.timer_g_interval = Some(interval);
                    timers.timer_g = Some(start_timer(&data.key, "G", interval, cmd_tx.clone()));
                }
                timers.timer_h = Some(start_timer(&data.key, "H", data.timers.transaction_timeout, cmd_tx));
            }
            TransactionState::Confirmed => {
                if data.reliable {
                    let _ = cmd_tx
                        .send(InternalTransactionCommand::TransitionTo(TransactionState::Terminated))
                        .await;
                } else {
                    timers.timer_i = Some(start_timer(&data.key, "I", data.timers.t4, cmd_tx));
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_timer(
        &self,
        data: &Arc<ServerTransactionData>,
        timer: &'static str,
        current_state: TransactionState,
        timers: &mut InviteServerTimers,
    ) -> Result<Option<TransactionState>> {
        match (timer, current_state) {
            ("100", TransactionState::Proceeding) => {
                // Only if the TU has not responded in the meantime.
                let mut last_response = data.last_response.lock().await;
                if last_response.is_none() {
                    let request = data.request.lock().await.clone();
                    let trying = utils::create_response(&request, StatusCode::TRYING);
                    *last_response = Some(trying.clone());
                    drop(last_response);
                    debug!(id = %data.key, "Answering 100 Trying on the TU's behalf");
                    data.transmit_response(trying).await;
                }
                Ok(None)
            }
            ("G", TransactionState::Completed) => {
                debug!(id = %data.key, "Timer G: retransmitting final response");
                data.retransmit_last_response().await;
                let interval = timers.timer_g_interval.unwrap_or(data.timers.t1);
                let next = data.timers.backoff(interval);
                timers.timer_g_interval = Some(next);
                timers.timer_g = Some(start_timer(&data.key, "G", next, data.cmd_tx.clone()));
                Ok(None)
            }
            ("H", TransactionState::Completed) => {
                // ACK never arrived: the far end is unreachable.
                warn!(id = %data.key, "Timer H: no ACK for final response");
                let _ = data
                    .events_tx
                    .send(TransactionEvent::TransactionTimeout { key: data.key.clone() })
                    .await;
                Ok(Some(TransactionState::Terminated))
            }
            ("I", TransactionState::Confirmed) => Ok(Some(TransactionState::Terminated)),
            (timer, state) => {
                trace!(id = %data.key, timer, ?state, "Timer fired outside its state; ignoring");
                Ok(None)
            }
        }
    }

    async fn process_message(
        &self,
        data: &Arc<ServerTransactionData>,
        message: Message,
        current_state: TransactionState,
        _timers: &mut InviteServerTimers,
    ) -> Result<Option<TransactionState>> {
        let request = match message {
            Message::Request(request) => request,
            Message::Response(_) => {
                warn!(id = %data.key, "Server transaction received a response; ignoring");
                return Ok(None);
            }
        };

        match (request.method.clone(), current_state) {
            (Method::Invite, TransactionState::Proceeding)
            | (Method::Invite, TransactionState::Completed) => {
                // Retransmitted INVITE: replay the most recent response.
                debug!(id = %data.key, state = ?current_state, "Retransmitted INVITE; replaying response");
                data.retransmit_last_response().await;
                Ok(None)
            }
            (Method::Ack, TransactionState::Completed) => {
                let _ = data
                    .events_tx
                    .send(TransactionEvent::AckReceived {
                        key: data.key.clone(),
                        request,
                    })
                    .await;
                Ok(Some(TransactionState::Confirmed))
            }
            (Method::Ack, TransactionState::Confirmed) => {
                // Duplicate ACK while draining; absorbed silently.
                Ok(None)
            }
            (method, state) => {
                trace!(id = %data.key, %method, ?state, "Request ignored in this state");
                Ok(None)
            }
        }
    }

    async fn send_response(
        &self,
        data: &Arc<ServerTransactionData>,
        response: Response,
        current_state: TransactionState,
        timers: &mut InviteServerTimers,
    ) -> Result<Option<TransactionState>> {
        if current_state != TransactionState::Proceeding {
            warn!(id = %data.key, state = ?current_state, "TU response outside Proceeding; dropping");
            return Ok(None);
        }

        // The TU spoke; the automatic 100 is moot.
        if let Some(handle) = timers.timer_100.take() {
            handle.abort();
        }

        let status = response.status;
        *data.last_response.lock().await = Some(response.clone());
        data.transmit_response(response).await;

        if status.is_provisional() {
            Ok(None)
        } else if status.is_success() {
            // 2xx: retransmissions and the ACK belong to the TU/dialog.
            Ok(Some(TransactionState::Terminated))
        } else {
            Ok(Some(TransactionState::Completed))
        }
    }
}

/// A running INVITE server transaction.
#[derive(Debug, Clone)]
pub struct ServerInviteTransaction {
    data: Arc<ServerTransactionData>,
}

impl ServerInviteTransaction {
    /// Spawns the transaction for a received INVITE and enters Proceeding.
    pub fn new(
        key: TransactionKey,
        request: Request,
        source: Destination,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<TransactionEvent>,
        timers: TimerSettings,
    ) -> Result<ServerInviteTransaction> {
        if request.method != Method::Invite {
            return Err(Error::InvalidOperation(
                "INVITE server transaction requires an INVITE request".to_string(),
            ));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let data = ServerTransactionParams {
            key,
            request,
            source,
            transport,
            events_tx,
            timers,
        }
        .into_data(cmd_tx);

        let logic = Arc::new(InviteServerLogic);
        let task = tokio::spawn(run_transaction_loop(data.clone(), logic, cmd_rx));
        *data.task.lock().unwrap() = Some(task);

        // Fresh mailbox; queueing the initial transition cannot fail.
        let _ = data
            .cmd_tx
            .try_send(InternalTransactionCommand::TransitionTo(TransactionState::Proceeding));

        Ok(ServerInviteTransaction { data })
    }

    /// Hands a TU response to the transaction for transmission.
    pub async fn send_response(&self, response: Response) -> Result<()> {
        self.data
            .cmd_tx
            .send(InternalTransactionCommand::SendResponse(response))
            .await
            .map_err(|_| Error::MailboxClosed(self.data.key.clone()))
    }

    /// Routes a request (retransmission or ACK) into the transaction.
    pub async fn process_request(&self, request: Request) -> Result<()> {
        self.data
            .cmd_tx
            .send(InternalTransactionCommand::ProcessMessage(Message::Request(request)))
            .await
            .map_err(|_| Error::MailboxClosed(self.data.key.clone()))
    }

    /// The transaction's key.
    pub fn key(&self) -> &TransactionKey {
        &self.data.key
    }

    /// The current state.
    pub fn state(&self) -> TransactionState {
        self.data.state.get()
    }

    /// The mailbox sender, for the manager's registry.
    pub fn command_sender(&self) -> mpsc::Sender<InternalTransactionCommand> {
        self.data.cmd_tx.clone()
    }

    /// The original INVITE.
    pub async fn original_request(&self) -> Request {
        self.data.request.lock().await.clone()
    }
}
