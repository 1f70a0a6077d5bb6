//! The UAS request pipeline.
//!
//! Consumes [`TransactionEvent`]s from the transaction manager and drives
//! registered cores through the RFC 3261 Section 8.2 receive sequence:
//!
//! 1. ensure a server transaction exists (idempotent with the router),
//! 2. run the validation chain — method (405), merged-request/loop (482),
//!    required extensions (420) — short-circuiting on the first failure,
//!    which has already sent its rejection when it surfaces,
//! 3. dispatch the surviving request to the core and send its reply with
//!    the Section 8.2.6 response side effects: auto-populated `Allow` /
//!    `Supported` / `Server`, a generated To-tag on final responses, and
//!    `Record-Route` copied through on dialog-establishing responses.
//!
//! The Require check is skipped for CANCEL and ACK (Section 8.2.2.3), and
//! loop detection runs only for cores that opt in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use sipflow_sip_core::message::HeaderCarrier;
use sipflow_sip_core::{Header, HeaderName, Message, Method, Request, Response, StatusCode};
use sipflow_sip_transport::Destination;
use sipflow_transaction_core::utils::{create_response, generate_tag};
use sipflow_transaction_core::{TransactionEvent, TransactionKey, TransactionManager};

use crate::dialog::{DialogLayer, NullDialogLayer};
use crate::error::{Error, Result};
use crate::handler::{CoreAction, CoreContext, UserAgentCore};
use crate::registry::CoreRegistry;

/// The UA layer: core registry plus the event pump binding cores to the
/// transaction manager.
pub struct UserAgentLayer {
    manager: Arc<TransactionManager>,
    registry: Arc<CoreRegistry>,
    dialog: Arc<dyn DialogLayer>,
    /// Which core owns which live server transaction, for event fan-out.
    assignments: Mutex<HashMap<TransactionKey, Arc<dyn UserAgentCore>>>,
}

impl UserAgentLayer {
    /// A layer with no dialog support (2xx-to-INVITE still works; dialog
    /// bookkeeping is a no-op).
    pub fn new(manager: Arc<TransactionManager>) -> Arc<UserAgentLayer> {
        UserAgentLayer::with_dialog_layer(manager, Arc::new(NullDialogLayer))
    }

    /// A layer delegating dialog-establishing responses to `dialog`.
    pub fn with_dialog_layer(
        manager: Arc<TransactionManager>,
        dialog: Arc<dyn DialogLayer>,
    ) -> Arc<UserAgentLayer> {
        Arc::new(UserAgentLayer {
            manager,
            registry: Arc::new(CoreRegistry::new()),
            dialog,
            assignments: Mutex::new(HashMap::new()),
        })
    }

    /// The core registry (register cores before traffic arrives).
    pub fn registry(&self) -> &Arc<CoreRegistry> {
        &self.registry
    }

    /// The transaction manager this layer drives.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Spawns the event pump over the manager's TU event stream.
    pub fn spawn(self: &Arc<Self>, events_rx: mpsc::Receiver<TransactionEvent>) -> JoinHandle<()> {
        let layer = Arc::clone(self);
        tokio::spawn(layer.run(events_rx))
    }

    /// Consumes transaction events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events_rx: mpsc::Receiver<TransactionEvent>) {
        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        debug!("Transaction event channel closed; UA layer exiting");
    }

    async fn handle_event(&self, event: TransactionEvent) {
        match event {
            TransactionEvent::NewRequest { request, source } => {
                if let Err(e) = self.handle_new_request(request, source).await {
                    debug!(error = %e, "Request did not reach a core");
                }
            }
            TransactionEvent::StrayAck { request, .. } => {
                self.handle_stray_ack(request).await;
            }
            // CancelReceived is informational here: the CANCEL itself
            // arrives as NewRequest and is answered there.
            TransactionEvent::CancelReceived { .. } => {}
            TransactionEvent::TransactionTerminated { ref key } => {
                let core = self.assignments.lock().unwrap().remove(key);
                if let Some(core) = core {
                    core.on_transaction_event(&event).await;
                }
            }
            TransactionEvent::ProvisionalResponse { ref key, .. }
            | TransactionEvent::SuccessResponse { ref key, .. }
            | TransactionEvent::FailureResponse { ref key, .. }
            | TransactionEvent::AckReceived { ref key, .. }
            | TransactionEvent::TransactionTimeout { ref key }
            | TransactionEvent::TransportError { ref key } => {
                let core = self.assignments.lock().unwrap().get(key).cloned();
                if let Some(core) = core {
                    core.on_transaction_event(&event).await;
                }
            }
            _ => {}
        }
    }

    /// Starts a client transaction on behalf of `core` (UAC side).
    ///
    /// Responses routed back to the transaction — provisional, final,
    /// timeout, transport error — are delivered to the core through
    /// [`UserAgentCore::on_transaction_event`].
    pub async fn start_client_transaction(
        &self,
        core: Arc<dyn UserAgentCore>,
        request: Request,
        destination: Destination,
    ) -> Result<TransactionKey> {
        let key = self
            .manager
            .start_client_transaction(request, destination)
            .await?;
        self.assignments.lock().unwrap().insert(key.clone(), core);
        Ok(key)
    }

    /// The Section 8.2 receive sequence for a request no transaction
    /// claimed.
    async fn handle_new_request(&self, request: Request, source: Destination) -> Result<()> {
        let Some(core) = self.registry.find(&Message::Request(request.clone())) else {
            // RFC-compliant: nothing is listening, drop silently.
            trace!(method = %request.method, "No applicable core; dropping request");
            return Ok(());
        };

        if request.method == Method::Cancel {
            return self.handle_cancel(core, request, source).await;
        }

        let key = self
            .manager
            .start_server_transaction(request.clone(), source)
            .await?;
        self.assignments
            .lock()
            .unwrap()
            .insert(key.clone(), Arc::clone(&core));

        // Validation chain; each failure has already answered.
        self.validate_method(&core, &key, &request).await?;
        self.validate_loop(&core, &key, &request).await?;
        self.validate_required(&core, &key, &request).await?;

        let ctx = CoreContext {
            manager: Arc::clone(&self.manager),
            transaction: Some(key.clone()),
        };
        match core.on_request(&ctx, &request).await {
            CoreAction::Reply(response) => self.respond(&core, &key, &request, response).await,
            CoreAction::Noreply => Ok(()),
        }
    }

    /// CANCEL handling (Section 9.2): answer the CANCEL's own transaction
    /// — 200 when it matches a live INVITE server transaction, 481
    /// otherwise — then let the core act on the matched INVITE.
    async fn handle_cancel(
        &self,
        core: Arc<dyn UserAgentCore>,
        request: Request,
        source: Destination,
    ) -> Result<()> {
        let cancel_key = self
            .manager
            .start_server_transaction(request.clone(), source)
            .await?;
        self.assignments
            .lock()
            .unwrap()
            .insert(cancel_key.clone(), Arc::clone(&core));

        match self.manager.invite_targeted_by_cancel(&request) {
            Some(invite_key) => {
                info!(id = %invite_key, "CANCEL matched a pending INVITE");
                let ok = create_response(&request, StatusCode::OK);
                self.respond(&core, &cancel_key, &request, ok).await?;

                // The core decides the INVITE's fate (typically 487).
                let ctx = CoreContext {
                    manager: Arc::clone(&self.manager),
                    transaction: Some(cancel_key),
                };
                if let CoreAction::Reply(response) = core.on_request(&ctx, &request).await {
                    self.respond(&core, &invite_key, &request, response).await?;
                }
                Ok(())
            }
            None => {
                debug!("CANCEL matches no transaction; answering 481");
                let not_found =
                    create_response(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
                self.respond(&core, &cancel_key, &request, not_found).await
            }
        }
    }

    /// ACKs to 2xx arrive without a transaction; the core sees them for
    /// dialog purposes and cannot reply.
    async fn handle_stray_ack(&self, request: Request) {
        let Some(core) = self.registry.find(&Message::Request(request.clone())) else {
            trace!("No applicable core for stray ACK");
            return;
        };
        let ctx = CoreContext {
            manager: Arc::clone(&self.manager),
            transaction: None,
        };
        if let CoreAction::Reply(_) = core.on_request(&ctx, &request).await {
            warn!("Core tried to reply to an ACK; ignored");
        }
    }

    // ---- validation chain ----

    /// 405 Method Not Allowed with `Allow` from the core's own list
    /// (Section 8.2.1). ACK and CANCEL are implicitly allowed.
    async fn validate_method(
        &self,
        core: &Arc<dyn UserAgentCore>,
        key: &TransactionKey,
        request: &Request,
    ) -> Result<()> {
        let allowed = core.allowed_methods();
        if allowed.contains(&request.method)
            || matches!(request.method, Method::Ack | Method::Cancel)
        {
            return Ok(());
        }

        let mut response = create_response(request, StatusCode::METHOD_NOT_ALLOWED);
        response.set_header(Header::text(HeaderName::Allow, join_methods(&allowed)));
        self.respond(core, key, request, response).await?;
        Err(Error::Validation {
            status: StatusCode::METHOD_NOT_ALLOWED,
            reason: format!("{} not in the core's allow set", request.method),
            responded: true,
        })
    }

    /// 482 Loop Detected (Section 8.2.2.2), for cores that opted in.
    async fn validate_loop(
        &self,
        core: &Arc<dyn UserAgentCore>,
        key: &TransactionKey,
        request: &Request,
    ) -> Result<()> {
        if !core.detect_loops() || !self.manager.is_loop(request) {
            return Ok(());
        }

        let response = create_response(request, StatusCode::LOOP_DETECTED);
        self.respond(core, key, request, response).await?;
        Err(Error::Validation {
            status: StatusCode::LOOP_DETECTED,
            reason: "merged request detected".to_string(),
            responded: true,
        })
    }

    /// 420 Bad Extension with the offending tags in `Unsupported`
    /// (Section 8.2.2.3). Skipped for CANCEL and ACK.
    async fn validate_required(
        &self,
        core: &Arc<dyn UserAgentCore>,
        key: &TransactionKey,
        request: &Request,
    ) -> Result<()> {
        if matches!(request.method, Method::Cancel | Method::Ack) {
            return Ok(());
        }
        let required = request.require().map_err(Error::Codec)?;
        if required.is_empty() {
            return Ok(());
        }
        let supported = core.supported_extensions();
        let unsupported: Vec<String> = required
            .into_iter()
            .filter(|tag| !supported.iter().any(|s| s.eq_ignore_ascii_case(tag)))
            .collect();
        if unsupported.is_empty() {
            return Ok(());
        }

        let mut response = create_response(request, StatusCode::BAD_EXTENSION);
        response.set_header(Header::text(HeaderName::Unsupported, unsupported.join(", ")));
        self.respond(core, key, request, response).await?;
        Err(Error::Validation {
            status: StatusCode::BAD_EXTENSION,
            reason: format!("unsupported extensions: {}", unsupported.join(", ")),
            responded: true,
        })
    }

    // ---- response emission ----

    /// Sends a response through the server transaction with the Section
    /// 8.2.6 side effects applied.
    async fn respond(
        &self,
        core: &Arc<dyn UserAgentCore>,
        key: &TransactionKey,
        request: &Request,
        mut response: Response,
    ) -> Result<()> {
        // Auto-populate advertisement headers the core did not set.
        if response.header(&HeaderName::Allow).is_none() {
            let allowed = core.allowed_methods();
            if !allowed.is_empty() {
                response.push_header(Header::text(HeaderName::Allow, join_methods(&allowed)));
            }
        }
        if response.header(&HeaderName::Supported).is_none() {
            let supported = core.supported_extensions();
            if !supported.is_empty() {
                response.push_header(Header::text(HeaderName::Supported, supported.join(", ")));
            }
        }
        if response.header(&HeaderName::Server).is_none() {
            if let Some(server) = core.server_header() {
                response.push_header(Header::text(HeaderName::Server, server));
            }
        }

        // Final responses carry a To-tag (Section 8.2.6.2).
        if response.status.is_final() {
            if let Ok(Some(to)) = response.to_address() {
                if to.tag().is_none() {
                    response.set_header(Header::typed(
                        HeaderName::To,
                        sipflow_sip_core::HeaderValue::Address(to.with_tag(generate_tag())),
                    ));
                }
            }
        }

        if self.dialog.is_dialog_establishing(request, &response) {
            self.dialog.validate_dialog_response(request, &response).await?;

            // Record-Route copies through, order preserved (Section 12.1.1).
            if response.header(&HeaderName::RecordRoute).is_none() {
                for rr in request.headers_named(&HeaderName::RecordRoute) {
                    response.push_header(rr.clone());
                }
            }

            self.dialog.create_dialog(request, &response).await?;
        }

        self.manager.send_response(key, response).await?;
        Ok(())
    }
}

fn join_methods(methods: &[Method]) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
