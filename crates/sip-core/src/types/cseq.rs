//! The CSeq header.

use std::fmt;

use crate::types::method::Method;

/// A CSeq value: sequence number plus method (RFC 3261 Section 8.1.1.5).
///
/// Responses echo the request's CSeq, which lets client transactions tell
/// a CANCEL's responses apart from the INVITE's even though both share a
/// branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CSeq {
    /// The sequence number.
    pub seq: u32,
    /// The request method.
    pub method: Method,
}

impl CSeq {
    /// Creates a CSeq value.
    pub fn new(seq: u32, method: Method) -> CSeq {
        CSeq { seq, method }
    }

    /// The CSeq an ACK for this request carries: same number, method ACK
    /// (RFC 3261 Section 17.1.1.3).
    pub fn for_ack(&self) -> CSeq {
        CSeq::new(self.seq, Method::Ack)
    }

    /// The CSeq a CANCEL for this request carries (RFC 3261 Section 9.1).
    pub fn for_cancel(&self) -> CSeq {
        CSeq::new(self.seq, Method::Cancel)
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}
