use thiserror::Error;

use crate::message::Message;

/// A type alias for handling `Result`s within the codec.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or emitting SIP messages.
///
/// The framing errors (`ContentTooSmall`, `NoContentLength`) carry the
/// partially assembled message so transports can log what arrived before
/// dropping the datagram or resetting the stream.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The start line was not a valid request line or status line.
    #[error("Invalid start line: {0}")]
    InvalidStartLine(String),

    /// A header line could not be parsed.
    #[error("Invalid {name} header: {message}")]
    InvalidHeader {
        /// Header the error was found in.
        name: String,
        /// What was wrong with it.
        message: String,
    },

    /// Invalid SIP version literal (only `SIP/2.0` is accepted).
    #[error("Invalid SIP version")]
    InvalidVersion,

    /// A status line carried a non-numeric or out-of-range status code.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(String),

    /// Datagram framing: `Content-Length` promised more body bytes than the
    /// datagram contained. The message parsed so far is carried along.
    #[error("Content-Length exceeds available body ({expected} > {actual})")]
    ContentTooSmall {
        /// Value of the `Content-Length` header.
        expected: usize,
        /// Body bytes actually present.
        actual: usize,
        /// Start line and headers parsed before the body was found short.
        partial: Box<Message>,
    },

    /// Stream framing requires `Content-Length`; a message without it cannot
    /// be delimited and forces a framing reset.
    #[error("Missing Content-Length in stream-framed message")]
    NoContentLength {
        /// Start line and headers parsed before the framing failed.
        partial: Box<Message>,
    },

    /// A required header was absent when building a derived message.
    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    /// Message or header construction error.
    #[error("Builder error: {0}")]
    Builder(String),
}

impl Error {
    pub(crate) fn invalid_header(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidHeader {
            name: name.into(),
            message: message.into(),
        }
    }
}
