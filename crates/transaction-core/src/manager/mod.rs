//! The transaction manager: process-wide registry, loop-detection index,
//! and the router that binds transport, transactions and the TU together.
//!
//! One manager owns all live transactions. Two pump tasks run for its
//! lifetime: the transport pump routes inbound messages (RFC 3261
//! Sections 17.1.3 and 17.2.3 matching), and the event pump forwards
//! transaction events to the TU while reaping terminated transactions
//! from the registry — the single supervisor responsible for the
//! "registry entry removed on every exit path" invariant.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use sipflow_sip_core::message::HeaderCarrier;
use sipflow_sip_core::{Message, Method, Request, Response};
use sipflow_sip_transport::{Destination, Transport, TransportEvent};

use crate::error::{Error, Result};
use crate::transaction::client::{ClientInviteTransaction, ClientNonInviteTransaction};
use crate::transaction::server::{ServerInviteTransaction, ServerNonInviteTransaction};
use crate::transaction::{
    InternalTransactionCommand, TimerSettings, TransactionEvent, TransactionKey, TransactionState,
};
use crate::utils;

/// Capacity of the manager's event channels.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A live transaction of any kind, as held by the registry.
#[derive(Debug, Clone)]
enum TransactionRef {
    InviteClient(ClientInviteTransaction),
    NonInviteClient(ClientNonInviteTransaction),
    InviteServer(ServerInviteTransaction),
    NonInviteServer(ServerNonInviteTransaction),
}

impl TransactionRef {
    fn command_sender(&self) -> mpsc::Sender<InternalTransactionCommand> {
        match self {
            TransactionRef::InviteClient(t) => t.command_sender(),
            TransactionRef::NonInviteClient(t) => t.command_sender(),
            TransactionRef::InviteServer(t) => t.command_sender(),
            TransactionRef::NonInviteServer(t) => t.command_sender(),
        }
    }

    fn state(&self) -> TransactionState {
        match self {
            TransactionRef::InviteClient(t) => t.state(),
            TransactionRef::NonInviteClient(t) => t.state(),
            TransactionRef::InviteServer(t) => t.state(),
            TransactionRef::NonInviteServer(t) => t.state(),
        }
    }
}

/// A registry slot: the transaction plus its loop-index membership.
#[derive(Debug)]
struct Registered {
    transaction: TransactionRef,
    loop_key: Option<LoopKey>,
}

/// Loop-detection bucket key (RFC 3261 Section 8.2.2.2): From-tag,
/// Call-Id and CSeq identify "the same request seen again".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoopKey {
    from_tag: String,
    call_id: String,
    cseq_seq: u32,
    cseq_method: String,
}

impl LoopKey {
    /// Derives the bucket for a request; `None` when the request carries
    /// no From-tag, Call-Id or CSeq (nothing to correlate on).
    fn for_request(request: &Request) -> Option<LoopKey> {
        let from_tag = request.from_address().ok()??.tag()?.to_string();
        let call_id = request.call_id().ok()??.as_str().to_string();
        let cseq = request.cseq().ok()??;
        Some(LoopKey {
            from_tag,
            call_id,
            cseq_seq: cseq.seq,
            cseq_method: cseq.method.to_string(),
        })
    }
}

/// The transaction layer's front door.
///
/// Holds the registry (`TxKey -> handle`, at most one entry per key), the
/// loop-detection index, and the embedding API the TU drives:
/// [`start_client_transaction`](TransactionManager::start_client_transaction),
/// [`start_server_transaction`](TransactionManager::start_server_transaction),
/// [`send_response`](TransactionManager::send_response).
#[derive(Debug)]
pub struct TransactionManager {
    transport: Arc<dyn Transport>,
    registry: DashMap<TransactionKey, Registered>,
    loop_index: DashMap<LoopKey, HashSet<TransactionKey>>,
    /// Channel handed to every transaction; the event pump forwards it to
    /// the TU after reaping.
    internal_tx: mpsc::Sender<TransactionEvent>,
    timers: TimerSettings,
}

impl TransactionManager {
    /// Creates the manager and its pump tasks.
    ///
    /// `transport_rx` is the inbound event stream from the transport
    /// layer. The returned receiver carries every [`TransactionEvent`] to
    /// the TU.
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        timers: Option<TimerSettings>,
    ) -> (Arc<TransactionManager>, mpsc::Receiver<TransactionEvent>) {
        let (internal_tx, internal_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (tu_tx, tu_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let manager = Arc::new(TransactionManager {
            transport,
            registry: DashMap::new(),
            loop_index: DashMap::new(),
            internal_tx,
            timers: timers.unwrap_or_default(),
        });

        tokio::spawn(Arc::clone(&manager).event_pump(internal_rx, tu_tx));
        tokio::spawn(Arc::clone(&manager).transport_pump(transport_rx));

        (manager, tu_rx)
    }

    // ---- embedding API ----

    /// Starts a client transaction for `request` toward `destination` and
    /// sends the request.
    ///
    /// If the request's top Via carries no branch, a fresh RFC 3261 branch
    /// is generated (and a Via added when the request has none at all), so
    /// the transaction key is always cookie-based and globally unique.
    pub async fn start_client_transaction(
        &self,
        mut request: Request,
        destination: Destination,
    ) -> Result<TransactionKey> {
        self.ensure_branch(&mut request)?;
        let key = TransactionKey::for_client_request(&request)?;

        let transaction = match request.method {
            Method::Invite => TransactionRef::InviteClient(ClientInviteTransaction::new(
                key.clone(),
                request,
                destination,
                Arc::clone(&self.transport),
                self.internal_tx.clone(),
                self.timers.clone(),
            )?),
            Method::Ack => {
                return Err(Error::InvalidOperation(
                    "ACK is sent statelessly, not through a client transaction".to_string(),
                ))
            }
            _ => TransactionRef::NonInviteClient(ClientNonInviteTransaction::new(
                key.clone(),
                request,
                destination,
                Arc::clone(&self.transport),
                self.internal_tx.clone(),
                self.timers.clone(),
            )?),
        };

        self.register(key.clone(), transaction.clone(), None)?;

        let initiate = match &transaction {
            TransactionRef::InviteClient(t) => t.initiate().await,
            TransactionRef::NonInviteClient(t) => t.initiate().await,
            _ => unreachable!(),
        };
        if let Err(e) = initiate {
            self.unregister(&key);
            return Err(e);
        }

        info!(id = %key, "Client transaction started");
        Ok(key)
    }

    /// Starts a server transaction for a received request.
    ///
    /// Idempotent: if the key is already registered, the existing key is
    /// returned, so the router and the UAS pipeline can both "start" the
    /// transaction without a race.
    pub async fn start_server_transaction(
        &self,
        request: Request,
        source: Destination,
    ) -> Result<TransactionKey> {
        let key = TransactionKey::from_request(&request)?;
        if self.registry.contains_key(&key) {
            trace!(id = %key, "Server transaction already exists");
            return Ok(key);
        }

        let transaction = match request.method {
            Method::Invite => TransactionRef::InviteServer(ServerInviteTransaction::new(
                key.clone(),
                request.clone(),
                source,
                Arc::clone(&self.transport),
                self.internal_tx.clone(),
                self.timers.clone(),
            )?),
            Method::Ack => {
                return Err(Error::InvalidOperation(
                    "ACK does not create a server transaction".to_string(),
                ))
            }
            _ => TransactionRef::NonInviteServer(ServerNonInviteTransaction::new(
                key.clone(),
                request.clone(),
                source,
                Arc::clone(&self.transport),
                self.internal_tx.clone(),
                self.timers.clone(),
            )?),
        };

        let loop_key = LoopKey::for_request(&request);
        self.register(key.clone(), transaction, loop_key)?;
        info!(id = %key, method = %request.method, "Server transaction started");
        Ok(key)
    }

    /// Hands a TU response to the server transaction matching `key`.
    pub async fn send_response(&self, key: &TransactionKey, response: Response) -> Result<()> {
        let sender = self
            .registry
            .get(key)
            .map(|r| r.transaction.command_sender())
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        sender
            .send(InternalTransactionCommand::SendResponse(response))
            .await
            .map_err(|_| Error::MailboxClosed(key.clone()))
    }

    /// Builds the ACK for a non-2xx final response (RFC 3261 Section
    /// 17.1.1.3). The INVITE client transaction sends these itself; the
    /// helper is exposed for TUs that ACK 2xx responses end-to-end.
    pub fn create_ack(&self, original: &Request, response: &Response) -> Result<Request> {
        utils::create_ack_from_invite(original, response)
    }

    /// Builds a CANCEL for a pending client transaction's request
    /// (RFC 3261 Section 9.1).
    pub fn create_cancel(&self, original: &Request) -> Result<Request> {
        utils::create_cancel(original)
    }

    /// Keys of all live transactions.
    pub fn list(&self) -> Vec<TransactionKey> {
        self.registry.iter().map(|entry| entry.key().clone()).collect()
    }

    /// The state of a live transaction, if registered.
    pub fn state_of(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.registry.get(key).map(|r| r.transaction.state())
    }

    /// Loop detection per RFC 3261 Section 8.2.2.2: the request carries
    /// no To-tag, and its (From-tag, Call-Id, CSeq) bucket holds a live
    /// server transaction under a *different* key — the same request seen
    /// again on another branch. The request's own transaction (a
    /// retransmission, or the entry the UAS pipeline just registered for
    /// this very request) never counts.
    pub fn is_loop(&self, request: &Request) -> bool {
        let has_to_tag = matches!(
            request.to_address(),
            Ok(Some(ref to)) if to.tag().is_some()
        );
        if has_to_tag {
            return false;
        }
        let Some(loop_key) = LoopKey::for_request(request) else {
            return false;
        };
        let Some(bucket) = self.loop_index.get(&loop_key) else {
            return false;
        };
        match TransactionKey::from_request(request) {
            Ok(own_key) => bucket.iter().any(|key| *key != own_key),
            Err(_) => !bucket.is_empty(),
        }
    }

    /// The live INVITE server transaction a CANCEL targets, if any: same
    /// key as the CANCEL but with method INVITE (RFC 3261 Section 9.2).
    pub fn invite_targeted_by_cancel(&self, cancel: &Request) -> Option<TransactionKey> {
        let key = TransactionKey::from_request(cancel).ok()?;
        let invite_key = TransactionKey {
            method: Method::Invite,
            ..key
        };
        self.registry.contains_key(&invite_key).then_some(invite_key)
    }

    /// Terminates every live transaction and drops it from the registry.
    pub async fn shutdown(&self) {
        info!(count = self.registry.len(), "Shutting down transaction layer");
        let senders: Vec<_> = self
            .registry
            .iter()
            .map(|entry| entry.value().transaction.command_sender())
            .collect();
        for sender in senders {
            let _ = sender.send(InternalTransactionCommand::Terminate).await;
        }
    }

    // ---- internals ----

    /// Atomic insert; a duplicate key aborts creation (the caller decides
    /// what to do with the message).
    fn register(&self, key: TransactionKey, transaction: TransactionRef, loop_key: Option<LoopKey>) -> Result<()> {
        match self.registry.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::Duplicate(key)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                if let Some(loop_key) = &loop_key {
                    self.loop_index
                        .entry(loop_key.clone())
                        .or_default()
                        .insert(key.clone());
                }
                slot.insert(Registered {
                    transaction,
                    loop_key,
                });
                Ok(())
            }
        }
    }

    fn unregister(&self, key: &TransactionKey) {
        if let Some((_, registered)) = self.registry.remove(key) {
            if let Some(loop_key) = registered.loop_key {
                if let Some(mut bucket) = self.loop_index.get_mut(&loop_key) {
                    bucket.remove(key);
                    let empty = bucket.is_empty();
                    drop(bucket);
                    if empty {
                        self.loop_index.remove_if(&loop_key, |_, b| b.is_empty());
                    }
                }
            }
            debug!(id = %key, "Transaction unregistered");
        }
    }

    /// Adds a generated branch (and a Via when absent) to an outgoing
    /// request that does not carry one.
    fn ensure_branch(&self, request: &mut Request) -> Result<()> {
        use sipflow_sip_core::{Header, HeaderName, HeaderValue, ViaEntry};

        let top_via = request.top_via().map_err(Error::Codec)?;
        match top_via {
            Some(via) if via.branch().map(|b| !b.is_empty()).unwrap_or(false) => Ok(()),
            Some(mut via) => {
                via.params.set("branch", Some(utils::generate_branch()));
                request.set_header(Header::typed(HeaderName::Via, HeaderValue::Via(vec![via])));
                Ok(())
            }
            None => {
                let local = self.transport.local_addr().map_err(Error::Transport)?;
                let via = ViaEntry::new(
                    self.transport.kind().as_str(),
                    local.ip().to_string(),
                    Some(local.port()),
                )
                .with_branch(utils::generate_branch());
                request
                    .headers_mut()
                    .insert(0, Header::typed(HeaderName::Via, HeaderValue::Via(vec![via])));
                Ok(())
            }
        }
    }

    /// Forwards transaction events to the TU, reaping terminated
    /// transactions along the way.
    async fn event_pump(
        self: Arc<Self>,
        mut internal_rx: mpsc::Receiver<TransactionEvent>,
        tu_tx: mpsc::Sender<TransactionEvent>,
    ) {
        while let Some(event) = internal_rx.recv().await {
            if let TransactionEvent::TransactionTerminated { key } = &event {
                self.unregister(key);
            }
            if tu_tx.send(event).await.is_err() {
                debug!("TU event channel closed; event pump exiting");
                break;
            }
        }
    }

    /// Consumes transport events and routes messages.
    async fn transport_pump(self: Arc<Self>, mut transport_rx: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = transport_rx.recv().await {
            match event {
                TransportEvent::MessageReceived { message, source, .. } => {
                    self.route(message, source).await;
                }
                TransportEvent::ParseError { error, source } => {
                    warn!(%source, %error, "Dropped unparseable message");
                }
                TransportEvent::Error { error } => {
                    warn!(%error, "Transport reported an error");
                }
                TransportEvent::Closed => {
                    debug!("Transport closed; router exiting");
                    break;
                }
            }
        }
    }

    /// The router (message processing pipeline entry point).
    ///
    /// Matching transactions get the message in their mailbox. A mailbox
    /// that closed between lookup and dispatch falls through to the stray
    /// path rather than dropping the message — an ACK racing a terminating
    /// INVITE server transaction must still reach the TU.
    async fn route(&self, message: Message, source: Destination) {
        match message {
            Message::Response(response) => {
                let key = match TransactionKey::from_response(&response) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "Dropping unroutable response");
                        return;
                    }
                };
                if let Some(sender) = self.registry.get(&key).map(|r| r.transaction.command_sender()) {
                    trace!(id = %key, "Routing response to client transaction");
                    if sender
                        .send(InternalTransactionCommand::ProcessMessage(Message::Response(
                            response.clone(),
                        )))
                        .await
                        .is_ok()
                    {
                        return;
                    }
                }
                debug!(id = %key, status = %response.status, "Response matches no transaction");
                let _ = self
                    .internal_tx
                    .send(TransactionEvent::StrayResponse { response })
                    .await;
            }
            Message::Request(request) => {
                let key = match TransactionKey::from_request(&request) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, method = %request.method, "Dropping unroutable request");
                        return;
                    }
                };

                if let Some(sender) = self.registry.get(&key).map(|r| r.transaction.command_sender()) {
                    trace!(id = %key, method = %request.method, "Routing request to server transaction");
                    if sender
                        .send(InternalTransactionCommand::ProcessMessage(Message::Request(
                            request.clone(),
                        )))
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    // Terminated between lookup and dispatch; fall through.
                }

                match request.method {
                    Method::Ack => {
                        // ACK to a 2xx: end-to-end, the dialog layer's
                        // business.
                        debug!(id = %key, "Stray ACK passed to the TU");
                        let _ = self
                            .internal_tx
                            .send(TransactionEvent::StrayAck { request, source })
                            .await;
                    }
                    Method::Cancel => {
                        // A CANCEL is its own transaction, but the TU needs
                        // to know which INVITE it targets (if any).
                        if let Some(invite_key) = self.invite_targeted_by_cancel(&request) {
                            debug!(id = %invite_key, "CANCEL targets a live INVITE transaction");
                            let _ = self
                                .internal_tx
                                .send(TransactionEvent::CancelReceived {
                                    key: invite_key,
                                    request: request.clone(),
                                })
                                .await;
                        }
                        let _ = self
                            .internal_tx
                            .send(TransactionEvent::NewRequest { request, source })
                            .await;
                    }
                    _ => {
                        trace!(id = %key, method = %request.method, "New request offered to the TU");
                        let _ = self
                            .internal_tx
                            .send(TransactionEvent::NewRequest { request, source })
                            .await;
                    }
                }
            }
        }
    }
}
