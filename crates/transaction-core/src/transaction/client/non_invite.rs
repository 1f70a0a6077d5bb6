//! Non-INVITE client transaction (RFC 3261 Section 17.1.2).
//!
//! Timer E retransmits the request over unreliable transports, doubling
//! from T1 up to T2 (and pinned at T2 once a provisional arrives); Timer F
//! bounds the attempt at 64·T1 measured from the first send — it survives
//! the Trying→Proceeding transition with its original deadline; Timer K
//! lingers in Completed for T4 to absorb response retransmissions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

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

/// Handles for the non-INVITE client timers (E, F, K).
#[derive(Debug, Default)]
struct NonInviteClientTimers {
    timer_e: Option<JoinHandle<()>>,
    /// Current Timer E interval; doubles to the T2 cap.
    timer_e_interval: Option<Duration>,
    timer_f: Option<JoinHandle<()>>,
    /// Original Timer F deadline, preserved across state changes.
    timer_f_deadline: Option<Instant>,
    timer_k: Option<JoinHandle<()>>,
}

/// The Section 17.1.2 state machine.
#[derive(Debug, Default)]
struct NonInviteClientLogic;

impl NonInviteClientLogic {
    fn start_timer_e(
        &self,
        data: &Arc<ClientTransactionData>,
        timers: &mut NonInviteClientTimers,
        interval: Duration,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) {
        timers.timer_e_interval = Some(interval);
        timers.timer_e = Some(start_timer(&data.key, "E", interval, cmd_tx));
        trace!(id = %data.key, ?interval, "Started Timer E");
    }

    /// (Re)arms Timer F toward its original deadline, so transitioning to
    /// Proceeding does not extend the 64·T1 deadline.
    fn arm_timer_f(
        &self,
        data: &Arc<ClientTransactionData>,
        timers: &mut NonInviteClientTimers,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) {
        let deadline = *timers
            .timer_f_deadline
            .get_or_insert_with(|| Instant::now() + data.timers.transaction_timeout);
        let remaining = deadline.saturating_duration_since(Instant::now());
        timers.timer_f = Some(start_timer(&data.key, "F", remaining, cmd_tx));
        trace!(id = %data.key, ?remaining, "Armed Timer F");
    }
}

#[async_trait]
impl TransactionLogic<ClientTransactionData, NonInviteClientTimers> for NonInviteClientLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteClient
    }

    fn cancel_all_timers(&self, timers: &mut NonInviteClientTimers) {
        for handle in [
            timers.timer_e.take(),
            timers.timer_f.take(),
            timers.timer_k.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        timers.timer_e_interval = None;
        // timer_f_deadline survives on purpose.
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ClientTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timers: &mut NonInviteClientTimers,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()> {
        match new_state {
            TransactionState::Trying => {
                data.transmit_request().await;
                if !data.reliable {
                    self.start_timer_e(data, timers, data.timers.t1, cmd_tx.clone());
                }
                self.arm_timer_f(data, timers, cmd_tx);
            }
            TransactionState::Proceeding => {
                // Once a provisional arrived, retransmissions slow to T2
                // and the original deadline keeps counting.
                if !data.reliable {
                    self.start_timer_e(data, timers, data.timers.t2, cmd_tx.clone());
                }
                self.arm_timer_f(data, timers, cmd_tx);
            }
            TransactionState::Completed => {
                if data.reliable {
                    let _ = cmd_tx
                        .send(InternalTransactionCommand::TransitionTo(TransactionState::Terminated))
                        .await;
                } else {
                    timers.timer_k = Some(start_timer(&data.key, "K", data.timers.t4, cmd_tx));
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
        timers: &mut NonInviteClientTimers,
    ) -> Result<Option<TransactionState>> {
        match (timer, current_state) {
            ("E", TransactionState::Trying) => {
                debug!(id = %data.key, "Timer E: retransmitting request");
                data.transmit_request().await;
                let interval = timers.timer_e_interval.unwrap_or(data.timers.t1);
                let next = data.timers.backoff(interval);
                self.start_timer_e(data, timers, next, data.cmd_tx.clone());
                Ok(None)
            }
            ("E", TransactionState::Proceeding) => {
                debug!(id = %data.key, "Timer E: retransmitting request (proceeding)");
                data.transmit_request().await;
                self.start_timer_e(data, timers, data.timers.t2, data.cmd_tx.clone());
                Ok(None)
            }
            ("F", TransactionState::Trying) | ("F", TransactionState::Proceeding) => {
                warn!(id = %data.key, "Timer F: transaction timed out");
                let _ = data
                    .events_tx
                    .send(TransactionEvent::TransactionTimeout { key: data.key.clone() })
                    .await;
                Ok(Some(TransactionState::Terminated))
            }
            ("K", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
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
        _timers: &mut NonInviteClientTimers,
    ) -> Result<Option<TransactionState>> {
        let response = validators::extract_response(message, &data.key)?;
        let original_method = data.request.lock().await.method.clone();
        if let Err(e) = validators::validate_response_matches(&response, &data.key, &original_method) {
            warn!(id = %data.key, error = %e, "Dropping non-matching response");
            return Ok(None);
        }
        *data.last_response.lock().await = Some(response.clone());

        let key = &data.key;
        let status = response.status;
        match current_state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if status.is_provisional() {
                    let _ = data
                        .events_tx
                        .send(TransactionEvent::ProvisionalResponse {
                            key: key.clone(),
                            response,
                        })
                        .await;
                    Ok(match current_state {
                        TransactionState::Trying => Some(TransactionState::Proceeding),
                        _ => None,
                    })
                } else {
                    let event = if status.is_success() {
                        TransactionEvent::SuccessResponse {
                            key: key.clone(),
                            response,
                        }
                    } else {
                        TransactionEvent::FailureResponse {
                            key: key.clone(),
                            response,
                        }
                    };
                    let _ = data.events_tx.send(event).await;
                    Ok(Some(TransactionState::Completed))
                }
            }
            // Completed: retransmitted finals are absorbed silently until
            // Timer K reaps the transaction.
            _ => Ok(None),
        }
    }
}

/// A running non-INVITE client transaction.
#[derive(Debug, Clone)]
pub struct ClientNonInviteTransaction {
    data: Arc<ClientTransactionData>,
}

impl ClientNonInviteTransaction {
    /// Spawns the transaction task. INVITE and ACK are rejected — INVITE
    /// has its own machine, and ACK never forms a client transaction.
    pub fn new(
        key: TransactionKey,
        request: Request,
        destination: Destination,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<TransactionEvent>,
        timers: TimerSettings,
    ) -> Result<ClientNonInviteTransaction> {
        if matches!(request.method, Method::Invite | Method::Ack) {
            return Err(Error::InvalidOperation(format!(
                "{} does not form a non-INVITE client transaction",
                request.method
            )));
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

        let logic = Arc::new(NonInviteClientLogic);
        let task = tokio::spawn(run_transaction_loop(data.clone(), logic, cmd_rx));
        *data.task.lock().unwrap() = Some(task);

        Ok(ClientNonInviteTransaction { data })
    }

    /// Sends the request and starts the Trying-state timers.
    pub async fn initiate(&self) -> Result<()> {
        if self.data.state.get() != TransactionState::Initial {
            return Err(Error::InvalidStateTransition {
                kind: TransactionKind::NonInviteClient,
                from: self.data.state.get(),
                to: TransactionState::Trying,
            });
        }
        self.data
            .cmd_tx
            .send(InternalTransactionCommand::TransitionTo(TransactionState::Trying))
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
