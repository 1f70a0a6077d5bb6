//! # sipflow-sip-transport
//!
//! Transport abstraction for the sipflow SIP stack.
//!
//! The transaction core is transport-agnostic: it sends through the
//! [`Transport`] trait, learns reliability from [`TransportKind`], and
//! consumes inbound traffic as [`TransportEvent`]s. Concrete socket
//! transports plug in from outside; the [`mock::MockTransport`] ships here
//! because every layer's test suite drives the stack through it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod events;
pub mod mock;
pub mod transport;

pub use error::{Error, Result};
pub use events::TransportEvent;
pub use transport::{
    response_destination, Destination, Transport, TransportKind, DEFAULT_SIP_PORT,
};

/// Common imports for transport users.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::events::TransportEvent;
    pub use crate::mock::MockTransport;
    pub use crate::transport::{
        response_destination, Destination, Transport, TransportKind, DEFAULT_SIP_PORT,
    };
}
