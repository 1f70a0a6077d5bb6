//! Non-INVITE server transaction (RFC 3261 Section 17.2.2).
//!
//! The request is handed to the TU on creation; the transaction waits in
//! Trying, replays the latest provisional from Proceeding and the final
//! from Completed when the request is retransmitted, and lingers in
//! Completed for Timer J (64·T1 over unreliable transports) to absorb
//! stragglers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use sipflow_sip_core::{Message, Method, Request, Response};
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

/// Handle for the single non-INVITE server timer (J).
#[derive(Debug, Default)]
struct NonInviteServerTimers {
    timer_j: Option<JoinHandle<()>>,
}

/// The Section 17.2.2 state machine.
#[derive(Debug, Default)]
struct NonInviteServerLogic;

#[async_trait]
impl TransactionLogic<ServerTransactionData, NonInviteServerTimers> for NonInviteServerLogic {
    fn kind(&self) -> TransactionKind {
        TransactionKind::NonInviteServer
    }

    fn cancel_all_timers(&self, timers: &mut NonInviteServerTimers) {
        if let Some(handle) = timers.timer_j.take() {
            handle.abort();
        }
    }

    async fn on_enter_state(
        &self,
        data: &Arc<ServerTransactionData>,
        new_state: TransactionState,
        _previous_state: TransactionState,
        timers: &mut NonInviteServerTimers,
        cmd_tx: mpsc::Sender<InternalTransactionCommand>,
    ) -> Result<()> {
        if new_state == TransactionState::Completed {
            if data.reliable {
                let _ = cmd_tx
                    .send(InternalTransactionCommand::TransitionTo(TransactionState::Terminated))
                    .await;
            } else {
                timers.timer_j = Some(start_timer(&data.key, "J", data.timers.transaction_timeout, cmd_tx));
            }
        }
        Ok(())
    }

    async fn handle_timer(
        &self,
        data: &Arc<ServerTransactionData>,
        timer: &'static str,
        current_state: TransactionState,
        _timers: &mut NonInviteServerTimers,
    ) -> Result<Option<TransactionState>> {
        match (timer, current_state) {
            ("J", TransactionState::Completed) => Ok(Some(TransactionState::Terminated)),
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
        _timers: &mut NonInviteServerTimers,
    ) -> Result<Option<TransactionState>> {
        let request = match message {
            Message::Request(request) => request,
            Message::Response(_) => {
                warn!(id = %data.key, "Server transaction received a response; ignoring");
                return Ok(None);
            }
        };

        match current_state {
            // Nothing sent yet: the retransmission is discarded
            // (Section 17.2.2).
            TransactionState::Trying => {
                trace!(id = %data.key, method = %request.method, "Retransmission in Trying; discarded");
                Ok(None)
            }
            TransactionState::Proceeding | TransactionState::Completed => {
                debug!(id = %data.key, state = ?current_state, "Retransmitted request; replaying response");
                data.retransmit_last_response().await;
                Ok(None)
            }
            other => {
                trace!(id = %data.key, state = ?other, "Request ignored in this state");
                Ok(None)
            }
        }
    }

    async fn send_response(
        &self,
        data: &Arc<ServerTransactionData>,
        response: Response,
        current_state: TransactionState,
        _timers: &mut NonInviteServerTimers,
    ) -> Result<Option<TransactionState>> {
        match current_state {
            TransactionState::Trying | TransactionState::Proceeding => {
                let status = response.status;
                *data.last_response.lock().await = Some(response.clone());
                data.transmit_response(response).await;

                if status.is_provisional() {
                    Ok(match current_state {
                        TransactionState::Trying => Some(TransactionState::Proceeding),
                        _ => None,
                    })
                } else {
                    Ok(Some(TransactionState::Completed))
                }
            }
            other => {
                warn!(id = %data.key, state = ?other, "TU response after final; dropping");
                Ok(None)
            }
        }
    }
}

/// A running non-INVITE server transaction.
#[derive(Debug, Clone)]
pub struct ServerNonInviteTransaction {
    data: Arc<ServerTransactionData>,
}

impl ServerNonInviteTransaction {
    /// Spawns the transaction for a received request and enters Trying.
    /// INVITE and ACK are rejected — INVITE has its own machine, ACK
    /// never creates a transaction.
    pub fn new(
        key: TransactionKey,
        request: Request,
        source: Destination,
        transport: Arc<dyn Transport>,
        events_tx: mpsc::Sender<TransactionEvent>,
        timers: TimerSettings,
    ) -> Result<ServerNonInviteTransaction> {
        if matches!(request.method, Method::Invite | Method::Ack) {
            return Err(Error::InvalidOperation(format!(
                "{} does not form a non-INVITE server transaction",
                request.method
            )));
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

        let logic = Arc::new(NonInviteServerLogic);
        let task = tokio::spawn(run_transaction_loop(data.clone(), logic, cmd_rx));
        *data.task.lock().unwrap() = Some(task);

        let _ = data
            .cmd_tx
            .try_send(InternalTransactionCommand::TransitionTo(TransactionState::Trying));

        Ok(ServerNonInviteTransaction { data })
    }

    /// Hands a TU response to the transaction for transmission.
    pub async fn send_response(&self, response: Response) -> Result<()> {
        self.data
            .cmd_tx
            .send(InternalTransactionCommand::SendResponse(response))
            .await
            .map_err(|_| Error::MailboxClosed(self.data.key.clone()))
    }

    /// Routes a retransmitted request into the transaction.
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

    /// The original request.
    pub async fn original_request(&self) -> Request {
        self.data.request.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::prelude::*;
    use sipflow_sip_transport::mock::MockTransport;
    use std::time::Duration;

    fn test_message(branch: &str) -> Request {
        RequestBuilder::new(Method::Message, "sip:service@127.0.0.1")
            .unwrap()
            .via("127.0.0.1", Some(5070), "UDP", Some(branch))
            .from(None, "sip:alice@atlanta.example.com", Some("ft-sn"))
            .unwrap()
            .to(None, "sip:service@127.0.0.1", None)
            .unwrap()
            .call_id("server-non-invite-test")
            .cseq(7)
            .body("hi")
            .build()
    }

    struct Setup {
        transaction: ServerNonInviteTransaction,
        transport: MockTransport,
        request: Request,
    }

    fn setup(branch: &str) -> Setup {
        let (transport, _transport_rx) = MockTransport::udp();
        let (events_tx, _events_rx) = mpsc::channel(100);
        let request = test_message(branch);
        let key = TransactionKey::from_request(&request).unwrap();
        let transaction = ServerNonInviteTransaction::new(
            key,
            request.clone(),
            Destination::udp("127.0.0.1:5070".parse().unwrap()),
            Arc::new(transport.clone()),
            events_tx,
            TimerSettings::scaled_for_test(Duration::from_millis(10)),
        )
        .unwrap();
        Setup {
            transaction,
            transport,
            request,
        }
    }

    async fn wait_for_state(tx: &ServerNonInviteTransaction, state: TransactionState) {
        for _ in 0..200 {
            if tx.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("state never became {:?}, still {:?}", state, tx.state());
    }

    #[tokio::test]
    async fn final_response_completes_then_j_terminates() {
        let setup = setup("z9hG4bK-sn-1");
        wait_for_state(&setup.transaction, TransactionState::Trying).await;

        let ok = ResponseBuilder::from_request(StatusCode::OK, &setup.request)
            .to_tag("snt-1")
            .unwrap()
            .build();
        setup.transaction.send_response(ok).await.unwrap();
        wait_for_state(&setup.transaction, TransactionState::Completed).await;

        let (msg, _) = setup.transport.take_sent().unwrap();
        assert_eq!(msg.status(), Some(StatusCode::OK));

        // Retransmitted request replays the final.
        setup.transaction.process_request(setup.request.clone()).await.unwrap();
        setup
            .transport
            .wait_for_send(Duration::from_millis(500))
            .await
            .unwrap();
        let (msg, _) = setup.transport.take_sent().unwrap();
        assert_eq!(msg.status(), Some(StatusCode::OK));

        // Timer J reaps it.
        wait_for_state(&setup.transaction, TransactionState::Terminated).await;
    }

    #[tokio::test]
    async fn provisional_then_retransmission_replays_provisional() {
        let setup = setup("z9hG4bK-sn-2");
        wait_for_state(&setup.transaction, TransactionState::Trying).await;

        let trying = ResponseBuilder::from_request(StatusCode::TRYING, &setup.request).build();
        setup.transaction.send_response(trying).await.unwrap();
        wait_for_state(&setup.transaction, TransactionState::Proceeding).await;
        setup.transport.take_sent().unwrap();

        setup.transaction.process_request(setup.request.clone()).await.unwrap();
        setup
            .transport
            .wait_for_send(Duration::from_millis(500))
            .await
            .unwrap();
        let (msg, _) = setup.transport.take_sent().unwrap();
        assert_eq!(msg.status(), Some(StatusCode::TRYING));
    }

    #[tokio::test]
    async fn retransmission_in_trying_is_discarded() {
        let setup = setup("z9hG4bK-sn-3");
        wait_for_state(&setup.transaction, TransactionState::Trying).await;
        setup.transaction.process_request(setup.request.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(setup.transport.take_sent().is_none());
    }

    #[tokio::test]
    async fn ack_is_rejected_at_creation() {
        let (transport, _rx) = MockTransport::udp();
        let (events_tx, _events_rx) = mpsc::channel(8);
        let mut ack = test_message("z9hG4bK-sn-4");
        ack.method = Method::Ack;
        let key = TransactionKey::from_request(&ack).unwrap();
        assert!(ServerNonInviteTransaction::new(
            key,
            ack,
            Destination::udp("127.0.0.1:5070".parse().unwrap()),
            Arc::new(transport),
            events_tx,
            TimerSettings::default(),
        )
        .is_err());
    }
}
