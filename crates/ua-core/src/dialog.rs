//! The dialog layer's contract, as seen from the UAS pipeline.
//!
//! Dialog state management is an external collaborator: the pipeline only
//! needs to recognize dialog-establishing responses (2xx to INVITE,
//! RFC 3261 Section 12.1), have them validated, and notify the layer so
//! it can create the dialog. [`NullDialogLayer`] is the default for
//! dialog-less deployments.

use async_trait::async_trait;

use sipflow_sip_core::{Method, Request, Response};

use crate::error::Result;

/// Hooks the UAS pipeline calls around dialog-establishing responses.
#[async_trait]
pub trait DialogLayer: Send + Sync {
    /// Whether sending `response` to `request` establishes a dialog
    /// (Section 12.1: primarily a 2xx to INVITE).
    fn is_dialog_establishing(&self, request: &Request, response: &Response) -> bool {
        request.method == Method::Invite && response.status.is_success()
    }

    /// Validates a dialog-establishing response before it is sent
    /// (required headers, To-tag, Contact, ...).
    async fn validate_dialog_response(&self, request: &Request, response: &Response) -> Result<()>;

    /// Creates the UAS-side dialog for a validated response.
    async fn create_dialog(&self, request: &Request, response: &Response) -> Result<()>;
}

/// A dialog layer that accepts everything and stores nothing.
#[derive(Debug, Default)]
pub struct NullDialogLayer;

#[async_trait]
impl DialogLayer for NullDialogLayer {
    async fn validate_dialog_response(&self, _request: &Request, _response: &Response) -> Result<()> {
        Ok(())
    }

    async fn create_dialog(&self, _request: &Request, _response: &Response) -> Result<()> {
        Ok(())
    }
}
