//! The Via header.
//!
//! Via records the path a request took so responses can retrace it
//! (RFC 3261 Section 8.1.1.7 and 18.2.2). The transaction layer leans on
//! the top Via heavily: its `branch` parameter is the transaction
//! identifier, and its sent-by host/port participate in server transaction
//! keys.

use std::fmt;

use crate::types::param::Params;

/// Branch parameters opening with this cookie were generated by an
/// RFC 3261 implementation and are globally unique (Section 8.1.1.7).
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// One `Via` value: `SIP/2.0/<transport> host[:port][;params]`.
///
/// Several entries may share one header line, comma-separated; the parser
/// flattens them into a sequence in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaEntry {
    /// Transport token from the sent-protocol (`UDP`, `TCP`, `TLS`, ...),
    /// uppercased.
    pub transport: String,
    /// The sent-by host (domain, IPv4, or bracketed IPv6).
    pub sent_by_host: String,
    /// The sent-by port, when explicit. Absent means the transport default.
    pub sent_by_port: Option<u16>,
    /// Via parameters in wire order (`branch`, `received`, `rport`, ...).
    pub params: Params,
}

impl ViaEntry {
    /// Creates a Via entry without parameters.
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> ViaEntry {
        ViaEntry {
            transport: transport.into().to_ascii_uppercase(),
            sent_by_host: host.into(),
            sent_by_port: port,
            params: Params::default(),
        }
    }

    /// Adds the `branch` parameter, builder style.
    pub fn with_branch(mut self, branch: impl Into<String>) -> ViaEntry {
        self.params.set("branch", Some(branch.into()));
        self
    }

    /// The `branch` parameter, if any.
    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }

    /// The `received` parameter (address the request actually came from,
    /// RFC 3261 Section 18.2.1).
    pub fn received(&self) -> Option<&str> {
        self.params.get("received")
    }

    /// The `rport` parameter value, when present with a value (RFC 3581).
    pub fn rport(&self) -> Option<&str> {
        self.params.get("rport")
    }

    /// True when the branch opens with the RFC 3261 magic cookie.
    pub fn is_rfc3261(&self) -> bool {
        self.branch().map(|b| b.starts_with(MAGIC_COOKIE)).unwrap_or(false)
    }

    /// The sent-by port, defaulting to 5060 when absent.
    pub fn port_or_default(&self) -> u16 {
        self.sent_by_port.unwrap_or(5060)
    }
}

impl fmt::Display for ViaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by_host)?;
        if let Some(port) = self.sent_by_port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}
