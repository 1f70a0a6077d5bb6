use std::net::SocketAddr;

use thiserror::Error;

/// A type alias for handling `Result`s within the transport layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by transport implementations.
#[derive(Error, Debug)]
pub enum Error {
    /// Sending a message failed.
    #[error("Failed to send to {destination}: {message}")]
    SendFailed {
        /// The destination the send was addressed to.
        destination: SocketAddr,
        /// Underlying failure.
        message: String,
    },

    /// The transport has been closed.
    #[error("Transport closed")]
    Closed,

    /// The message could not be serialized or was rejected by the codec.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Binding or connecting failed.
    #[error("Connection error: {0}")]
    Connect(String),

    /// An I/O error from the socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
