//! Events transports deliver upward.

use sipflow_sip_core::Message;

use crate::transport::Destination;

/// What a transport reports to the layer above it.
///
/// The transaction manager consumes these from an `mpsc` channel; one
/// channel per listener, pumped by the manager's receive task.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message arrived and passed the codec.
    MessageReceived {
        /// The decoded message.
        message: Message,
        /// Where it came from.
        source: Destination,
        /// The local endpoint it arrived on.
        destination: Destination,
    },
    /// A datagram or stream segment failed to parse and was dropped.
    ParseError {
        /// Codec diagnostic.
        error: String,
        /// Where the bytes came from.
        source: Destination,
    },
    /// The transport failed and will deliver nothing further.
    Error {
        /// Transport diagnostic.
        error: String,
    },
    /// The transport was closed.
    Closed,
}
