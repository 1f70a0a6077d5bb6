//! # sipflow-sip-core
//!
//! SIP message model, codec and builders for the sipflow stack.
//!
//! This crate provides what the transaction layer needs from RFC 3261's
//! message grammar and nothing more:
//!
//! - The [`Message`]/[`Request`]/[`Response`] model with ordered headers
//!   and raw-or-parsed header values (lazy, idempotent header parsing).
//! - Datagram framing ([`parser::parse_datagram`]) and incremental stream
//!   framing ([`parser::StreamParser`]).
//! - Canonical serialization (`to_bytes`) with CRLF line endings and the
//!   canonical header casing (`Via`, `Content-Length`, `CSeq`, `Call-Id`,
//!   `Max-Forwards`, `From`, `To`).
//! - Typed values for the headers transactions route on: Via (with the
//!   `z9hG4bK` magic cookie), CSeq, Call-Id, From/To, Content-Length.
//! - [`builder::RequestBuilder`] / [`builder::ResponseBuilder`] for
//!   assembling messages programmatically.
//!
//! Full SIP-URI grammar, escaping rules and the long tail of header types
//! are out of scope; unknown headers round-trip as raw bytes.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod builder;
pub mod error;
pub mod message;
pub mod parser;
pub mod types;

pub use error::{Error, Result};
pub use message::{HeaderCarrier, Message, Request, Response, SIP_VERSION};
pub use types::{
    Address, CallId, CSeq, Header, HeaderName, HeaderValue, Method, Params, StatusCode, Uri,
    ViaEntry, MAGIC_COOKIE,
};

/// Common imports for working with SIP messages.
pub mod prelude {
    pub use crate::builder::{RequestBuilder, ResponseBuilder};
    pub use crate::error::{Error, Result};
    pub use crate::message::{HeaderCarrier, Message, Request, Response};
    pub use crate::parser::{parse_datagram, parse_header_value, StreamParser};
    pub use crate::types::{
        Address, CallId, CSeq, Header, HeaderName, HeaderValue, Method, Params, StatusCode, Uri,
        ViaEntry, MAGIC_COOKIE,
    };
}
