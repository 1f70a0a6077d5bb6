//! The transport contract the transaction core builds on.
//!
//! The core needs exactly three things from a transport: a way to send a
//! message toward a destination, a reliability flag (reliable transports
//! disable the retransmission timers, RFC 3261 Section 17), and a stream
//! of inbound messages delivered upward (see [`crate::events`]).
//!
//! Concrete UDP/TCP/TLS implementations live outside this crate; the
//! channel-backed [`crate::mock::MockTransport`] covers the test suites.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use async_trait::async_trait;

use sipflow_sip_core::message::HeaderCarrier;
use sipflow_sip_core::{Message, Request};

use crate::error::{Error, Result};

/// The default SIP port when a sent-by or URI carries none.
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// The transport protocol a message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// UDP datagrams.
    Udp,
    /// TCP streams.
    Tcp,
    /// TLS over TCP.
    Tls,
    /// WebSocket (RFC 7118).
    Ws,
}

impl TransportKind {
    /// Whether retransmission is handled below SIP. Reliable transports
    /// suppress timers A/E/G and zero the buffer-drain waits (D/I/K).
    pub fn is_reliable(&self) -> bool {
        match self {
            TransportKind::Udp => false,
            TransportKind::Tcp | TransportKind::Tls | TransportKind::Ws => true,
        }
    }

    /// The token used in Via sent-protocol position.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportKind::Udp),
            "TCP" => Ok(TransportKind::Tcp),
            "TLS" => Ok(TransportKind::Tls),
            "WS" | "WSS" => Ok(TransportKind::Ws),
            other => Err(Error::InvalidMessage(format!("unknown transport: {}", other))),
        }
    }
}

/// Where a message should be sent: address plus transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Socket address of the next hop.
    pub addr: SocketAddr,
    /// Transport to reach it over.
    pub kind: TransportKind,
}

impl Destination {
    /// A UDP destination.
    pub fn udp(addr: SocketAddr) -> Destination {
        Destination {
            addr,
            kind: TransportKind::Udp,
        }
    }

    /// A TCP destination.
    pub fn tcp(addr: SocketAddr) -> Destination {
        Destination {
            addr,
            kind: TransportKind::Tcp,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.addr)
    }
}

/// Abstract message transport.
///
/// Implementations own their sockets and deliver inbound traffic as
/// [`crate::events::TransportEvent`]s over the channel handed out at bind
/// time. Sends are non-blocking; backpressure or socket failure surfaces
/// as an error which the transaction layer treats as fatal for the
/// affected transaction.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends one message toward the destination.
    async fn send_message(&self, message: Message, destination: Destination) -> Result<()>;

    /// The local address the transport is bound to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// The transport protocol this instance speaks.
    fn kind(&self) -> TransportKind;

    /// Whether retransmission is handled below SIP.
    fn is_reliable(&self) -> bool {
        self.kind().is_reliable()
    }

    /// Closes the transport; subsequent sends fail with [`Error::Closed`].
    async fn close(&self) -> Result<()>;

    /// True once the transport is closed.
    fn is_closed(&self) -> bool;
}

/// Selects where a response to `request` should be sent, per RFC 3261
/// Section 18.2.2: prefer the top Via `received` address (with `rport`
/// when present), fall back to the sent-by host/port, and finally to the
/// source address the request arrived from.
pub fn response_destination(request: &Request, source: Destination) -> Destination {
    let Ok(Some(via)) = request.top_via() else {
        return source;
    };

    let kind = via
        .transport
        .parse::<TransportKind>()
        .unwrap_or(source.kind);

    let port = via
        .rport()
        .and_then(|p| p.parse::<u16>().ok())
        .or(via.sent_by_port)
        .unwrap_or(DEFAULT_SIP_PORT);

    let host = via.received().unwrap_or(via.sent_by_host.as_str());
    match host.trim_matches(|c| c == '[' || c == ']').parse::<std::net::IpAddr>() {
        Ok(ip) => Destination {
            addr: SocketAddr::new(ip, port),
            kind,
        },
        // Domain sent-by without `received`: respond to the source address,
        // keeping the Via transport.
        Err(_) => Destination {
            addr: source.addr,
            kind,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipflow_sip_core::prelude::*;

    fn request_with_via(via: &str) -> Request {
        let mut req = RequestBuilder::new(Method::Invite, "sip:b@example.com")
            .unwrap()
            .build();
        req.set_header(Header::text(HeaderName::Via, via));
        req
    }

    #[test]
    fn reliability_per_kind() {
        assert!(!TransportKind::Udp.is_reliable());
        assert!(TransportKind::Tcp.is_reliable());
        assert!(TransportKind::Tls.is_reliable());
    }

    #[test]
    fn response_goes_to_received_when_present() {
        let req = request_with_via("SIP/2.0/UDP client.example.com;branch=z9hG4bK1;received=192.0.2.9");
        let source = Destination::udp("198.51.100.1:40000".parse().unwrap());
        let dest = response_destination(&req, source);
        assert_eq!(dest.addr, "192.0.2.9:5060".parse().unwrap());
        assert_eq!(dest.kind, TransportKind::Udp);
    }

    #[test]
    fn response_uses_sent_by_port_and_rport() {
        let req = request_with_via("SIP/2.0/UDP 192.0.2.9:5080;branch=z9hG4bK1");
        let source = Destination::udp("198.51.100.1:40000".parse().unwrap());
        assert_eq!(
            response_destination(&req, source).addr,
            "192.0.2.9:5080".parse().unwrap()
        );

        let req = request_with_via("SIP/2.0/UDP 192.0.2.9:5080;branch=z9hG4bK1;rport=40001");
        assert_eq!(
            response_destination(&req, source).addr,
            "192.0.2.9:40001".parse().unwrap()
        );
    }

    #[test]
    fn response_falls_back_to_source_for_domains() {
        let req = request_with_via("SIP/2.0/TCP client.example.com;branch=z9hG4bK1");
        let source = Destination::tcp("198.51.100.1:5060".parse().unwrap());
        let dest = response_destination(&req, source);
        assert_eq!(dest.addr, source.addr);
        assert_eq!(dest.kind, TransportKind::Tcp);
    }
}
