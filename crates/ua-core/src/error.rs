use thiserror::Error;

use sipflow_sip_core::StatusCode;

/// A type alias for handling `Result`s within the UA core layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the UA core layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A request failed the UAS validation chain. The rejection response
    /// named by `status` has already been sent when `responded` is true.
    #[error("Request validation failed with {status}: {reason}")]
    Validation {
        /// The rejection status (405, 420, 482).
        status: StatusCode,
        /// What failed.
        reason: String,
        /// Whether the rejection response went out before this error
        /// surfaced.
        responded: bool,
    },

    /// The dialog layer refused a dialog-establishing response.
    #[error("Dialog validation failed: {0}")]
    Dialog(String),

    /// The transaction layer refused an operation.
    #[error("Transaction error: {0}")]
    Transaction(#[from] sipflow_transaction_core::Error),

    /// Codec failure while deriving a response.
    #[error("Codec error: {0}")]
    Codec(#[from] sipflow_sip_core::Error),
}
