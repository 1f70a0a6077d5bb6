//! INVITE client transaction (RFC 3261 Section 17.1.1).
//!
//! ```text
//!                    |INVITE sent
//!                    V
//!                +---------+    1xx    +------------+
//!                | Calling |---------->| Proceeding |
//!                +---------+           +------------+
//!                  |  |                   |   |
//!          2xx ----+  | 300-699, ACK sent |   +---- 2xx -> Terminated
//!           |         V                   V
//!           |     +-----------+ <---------+
//!           |     | Completed |  (Timer D)
//!           |     +-----------+
//!           V           |
//!      Terminated <-----+
//! ```
//!
//! Timer A retransmits the INVITE over unreliable transports (doubling
//! from T1), Timer B bounds the whole attempt at 64·T1, and Timer D keeps
//! the transaction alive in Completed to ACK retransmitted final
//! responses. A 2xx terminates the transaction at once — the ACK for a
//! 2xx is end-to-end and belongs to the TU (Section 13.2.2.4).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use sipflow_sip_core::{Message, Method, Request, Response};
use sipflow_sip_transport::{Destination, Transport};

use crate::error::{Error, Result};
use crate::transaction::client::{
    ClientTransactionData, ClientTransactionParams,
};
use crate::transaction::COMMAND_CHANNEL_CAPACITY;
use crate::transaction::logic::TransactionLogic;
use crate::transaction::runner::run_transaction_loop;
use crate::transaction::timer::start_timer;
use crate::transaction::validators;
use crate::transaction::{
    InternalTransactionCommand, TimerSettings, TransactionEvent, TransactionKey, TransactionKind,
    TransactionState,
};
use crate::utils;

/// Handles for the INVITE client timers (A, B, D).
#[derive(Debug, Default)]
struct InviteClientTimers {
    timer_a: Option<JoinHandle<()>>,
    /// Current Timer A interval; doubles on each firing.
    timer_a_interval: Option<Duration>,
    timer_b: Option<JoinHandle<()>>,
    timer_d: Option<JoinHandle<()>>,
}

/// The Section 17.1.1 state machine.
#[derive(Debug, Default)]
struct InviteClientLogic;

impl InviteClientLogic {
    fn start_timer_a(
        &self,
        data: &Arc<ClientTransactionData>,
        timers: &mut InviteClientTimers,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) {
        let interval = timers.timer_a_interval.unwrap_or(data.timers.t1);
        timers.timer_a_interval = Some(interval);
        timers.timer_a = Some(start_timer(&data.key, "A", interval, cmd_tx));
        trace!(id = %data.key, ?interval, "Started Timer A");
    }

    async fn ack_failure_response(&self, data: &Arc<ClientTransactionData>, response: &Response) -> Result<()> {
        let request = data.request.lock().await.clone();
        let ack = utils::create_ack_from_invite(&request, response)?;
        data.transport
            .send_message(Message::Request(ack), data.destination)
            .await
            .map_err(Error::Transport)
    }

    async fn process_response(
        &self,
        data: &Arc<ClientTransactionData>,
        response: Response,
        current_state: TransactionState,
    ) -> Result<Option<TransactionState>> {
        let key = &data.key;
        let status = response.status;

        match current_state {
            TransactionState::Calling | TransactionState::Proceeding => {
                if status.is_provisional() {
                    let _ = data
                        .events_tx
                        .send(TransactionEvent::ProvisionalResponse {
                            key: key.clone(),
                            response,
                        })
                        .await;
                    return Ok(match current_state {
                        TransactionState::Calling => Some(TransactionState::Proceeding),
                        _ => None,
                    });
                }
                if status.is_success() {
                    // 2xx: hand to TU and terminate; ACK is the TU's.
                    let _ = data
                        .events_tx
                        .send(TransactionEvent::SuccessResponse {
                            key: key.clone(),
                            response,
                        })
                        .await;
                    return Ok(Some(TransactionState::Terminated));
                }
                // 300-699: ACK locally, report, linger in Completed.
                if let Err(e) = self.ack_failure_response(data, &response).await {
                    error!(id = %key, error = %e, "Failed to ACK failure response");
                    let _ = data.cmd_tx.send(InternalTransactionCommand::TransportError).await;
                    return Ok(None);
                }
                let _ = data
                    .events_tx
                    .send(TransactionEvent::FailureResponse {
                        key: key.clone(),
                        response,
                    })
                    .await;
                Ok(Some(TransactionState::Completed))
            }
            TransactionState::Completed => {
                if status.is_failure() {
                    // Retransmitted final response: re-ACK, stay put.
                    debug!(id = %key, %status, "Re-ACKing retransmitted final response");
                    if let Err(e) = self.ack_failure_response(data, &response).await {
                        warn!(id = %key, error = %e, "Failed to re-ACK retransmission");
                    }
                }
                // Retransmissions do not touch Timer D.
                Ok(None)
            }
            other => {
                warn!(id = %key, state = ?other, "Response in unexpected state; ignoring");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl TransactionLogic<ClientTransactionData, InviteClientTimers> for InviteClientLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::InviteClient
    }

    fn cancel_all_timers(&self, timers: &mut InviteClientTimers) {
        for handle in [
            timers.timer_a.take(),
            timers.timer_b.take(),
            timers.timer_d.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        timers.timer_a_interval = None;
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ClientTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timers: &mut InviteClientTimers,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()> {
        match new_state {
            TransactionState::Calling => {
                data.transmit_request().await;
                if !data.reliable {
                    timers.timer_a_interval = Some(data.timers.t1);
                    self.start_timer_a(data, timers, cmd_tx.clone());
                }
                timers.timer_b = Some(start_timer(&data.key, "B", data.timers.transaction_timeout, cmd_tx));
            }
            TransactionState::Proceeding => {
                // Timers A and B stop outside Calling (Section 17.1.1.2);
                // the runner already cancelled them on transition.
            }
            TransactionState::Completed => {
                // Timer D absorbs retransmissions of the final response;
                // zero over reliable transports.
                if data.reliable {
                    let _ = cmd_tx
                        .send(InternalTransactionCommand::TransitionTo(TransactionState::Terminated))
                        .await;
                } else {
                    timers.timer_d = Some(start_timer(&data.key, "D", data.timers.wait_time_d, cmd_tx));
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_timer(
        &self,
        data: &Arc<ClientTransactionData>,
        timer: &'static str,
        current_state: TransactionState,
        timers: &mut InviteClientTimers,
    ) -> Result<Option<TransactionState>> {
        match (timer, current_state) {
            ("A", TransactionState::Calling) => {
                debug!(id = %data.key, "Timer A: retransmitting INVITE");
                data.transmit_request().await;
                let interval = timers.timer_a_interval.unwrap_or(data.timers.t1);
                timers.timer_a_interval = Some(data.timers.backoff(interval));
                self.start_timer_a(data, timers, data.cmd_tx.clone());
                Ok(None)
            }
            ("B", TransactionState::Calling) => {
                warn!(id = %data.key, "Timer B: INVITE transaction timed out");
                let _ = data
                    .events_tx
                    .send(TransactionEvent::TransactionTimeout { key: data.key.clone() })
                    .await;
                Ok(Some(TransactionState::Terminated))
            }
            ("D", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
            (timer, state) => {
                trace!(id = %data.key, timer, ?state, "Timer fired outside its state; ignoring");
                Ok(None)
            }
        }
    }

    async fn process_message(
        &self,
        data: &Arc<ClientTransactionData>,
        message: Message,
        current_state: TransactionState,
        _timers: &mut InviteClientTimers,
    ) -> Result<Option<TransactionState>> {
        let response = validators::extract_response(message, &data.key)?;
        let original_method = data.request.lock().await.method.clone();
        if let Err(e) = validators::validate_response_matches(&response, &data.key, &original_method) {
            warn!(id = %data.key, error = %e, "Dropping non-matching response");
            return Ok(None);
        }
        *data.last_response.lock().await = Some(response.clone());
        self.process_response(data, response, current_state).await
    }
}

/// A running INVITE client transaction.
#[derive(Debug, Clone)]
pub struct ClientInviteTransaction {
    data: Arc<ClientTransactionData>,
}

impl ClientInviteTransaction {
    /// Spawns the transaction task. The request must be an INVITE; call
    /// [`ClientInviteTransaction::initiate`] to send it.
    pub fn new(
        key: TransactionKey,
        request: Request,
        destination: Destination,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<TransactionEvent>,
        timers: TimerSettings,
    ) -> Result<ClientInviteTransaction> {
        if request.method != Method::Invite {
            return Err(Error::InvalidOperation(
                "INVITE client transaction requires an INVITE request".to_string(),
            ));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let data = ClientTransactionParams {
            key,
            request,
            destination,
            transport,
            events_tx,
            timers,
        }
        .into_data(cmd_tx);

        let logic = Arc::new(InviteClientLogic);
        let task = tokio::spawn(run_transaction_loop(data.clone(), logic, cmd_rx));
        *data.task.lock().unwrap() = Some(task);

        Ok(ClientInviteTransaction { data })
    }

    /// Sends the INVITE and starts the Calling-state timers.
    pub async fn initiate(&self) -> Result<()> {
        if self.data.state.get() != TransactionState::Initial {
            return Err(Error::InvalidStateTransition {
                kind: TransactionKind::InviteClient,
                from: self.data.state.get(),
                to: TransactionState::Calling,
            });
        }
        self.data
            .cmd_tx
            .send(InternalTransactionCommand::TransitionTo(TransactionState::Calling))
            .await
            .map_err(|_| Error::MailboxClosed(self.data.key.clone()))
    }

    /// Routes a response into the transaction's mailbox.
    pub async fn process_response(&self, response: Response) -> Result<()> {
        self.data
            .cmd_tx
            .send(InternalTransactionCommand::ProcessMessage(Message::Response(response)))
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

    /// The most recent response received.
    pub async fn last_response(&self) -> Option<Response> {
        self.data.last_response.lock().await.clone()
    }
}
