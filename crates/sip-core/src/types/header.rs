//! Generic SIP headers.
//!
//! Headers are stored on messages as an ordered sequence of [`Header`]
//! values. Each carries a [`HeaderName`] and a [`HeaderValue`] that is
//! either the raw bytes as received or an already-parsed representation.
//!
//! The design is two-tiered, like the rest of the codec: framing keeps
//! every header as raw bytes, and [`crate::parser::parse_header_value`]
//! upgrades individual headers to typed values on demand. Parsing is
//! idempotent — an already-typed value passes through untouched — so
//! callers never need to track what has been parsed before.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::types::address::Address;
use crate::types::call_id::CallId;
use crate::types::cseq::CSeq;
use crate::types::via::ViaEntry;

/// Names of the headers the core knows how to parse and route on.
///
/// Unknown names are retained in `Other`, lowercased; comparison is
/// case-insensitive because every name is normalized when it enters the
/// system (RFC 3261 Section 7.3.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeaderName {
    /// Via (compact form `v`)
    Via,
    /// From (compact form `f`)
    From,
    /// To (compact form `t`)
    To,
    /// Call-Id (compact form `i`)
    CallId,
    /// CSeq
    CSeq,
    /// Content-Length (compact form `l`)
    ContentLength,
    /// Max-Forwards
    MaxForwards,
    /// Contact (compact form `m`)
    Contact,
    /// Content-Type (compact form `c`)
    ContentType,
    /// Route
    Route,
    /// Record-Route
    RecordRoute,
    /// Require
    Require,
    /// Supported (compact form `k`)
    Supported,
    /// Unsupported
    Unsupported,
    /// Allow
    Allow,
    /// Server
    Server,
    /// Subject (compact form `s`)
    Subject,
    /// Expires
    Expires,
    /// Any other header, lowercased.
    Other(String),
}

impl HeaderName {
    /// Canonical casing used when the header is emitted on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-Id",
            HeaderName::CSeq => "CSeq",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Contact => "Contact",
            HeaderName::ContentType => "Content-Type",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Require => "Require",
            HeaderName::Supported => "Supported",
            HeaderName::Unsupported => "Unsupported",
            HeaderName::Allow => "Allow",
            HeaderName::Server => "Server",
            HeaderName::Subject => "Subject",
            HeaderName::Expires => "Expires",
            HeaderName::Other(s) => s,
        }
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeaderName {
    type Err = Error;

    /// Normalizes a header name: case-insensitive, with the RFC 3261
    /// compact forms (`v l f t i m c k s`) expanded to their full names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::invalid_header("", "empty header name"));
        }
        let lower = s.to_ascii_lowercase();
        Ok(match lower.as_str() {
            "via" | "v" => HeaderName::Via,
            "from" | "f" => HeaderName::From,
            "to" | "t" => HeaderName::To,
            "call-id" | "i" => HeaderName::CallId,
            "cseq" => HeaderName::CSeq,
            "content-length" | "l" => HeaderName::ContentLength,
            "max-forwards" => HeaderName::MaxForwards,
            "contact" | "m" => HeaderName::Contact,
            "content-type" | "c" => HeaderName::ContentType,
            "route" => HeaderName::Route,
            "record-route" => HeaderName::RecordRoute,
            "require" => HeaderName::Require,
            "supported" | "k" => HeaderName::Supported,
            "unsupported" => HeaderName::Unsupported,
            "allow" => HeaderName::Allow,
            "server" => HeaderName::Server,
            "subject" | "s" => HeaderName::Subject,
            "expires" => HeaderName::Expires,
            _ => HeaderName::Other(lower),
        })
    }
}

/// A header value, raw or parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Uninterpreted bytes exactly as received (after folding).
    Raw(Vec<u8>),
    /// One or more Via entries (a single comma-separated line parses to
    /// several entries; several lines stay several headers).
    Via(Vec<ViaEntry>),
    /// A CSeq value.
    CSeq(CSeq),
    /// A Call-Id value.
    CallId(CallId),
    /// A From/To style address with parameters.
    Address(Address),
    /// A non-negative integer (Content-Length, Max-Forwards, Expires).
    UInt(u32),
    /// A comma-separated token list (Require, Supported, Allow, ...).
    TokenList(Vec<String>),
}

impl HeaderValue {
    /// True when the value has not been upgraded to a typed form yet.
    pub fn is_raw(&self) -> bool {
        matches!(self, HeaderValue::Raw(_))
    }

    /// The value as UTF-8 text, when it is raw and valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Raw(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Raw(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            HeaderValue::Via(entries) => {
                let mut first = true;
                for entry in entries {
                    if !first {
                        f.write_str(", ")?;
                    }
                    first = false;
                    write!(f, "{}", entry)?;
                }
                Ok(())
            }
            HeaderValue::CSeq(cseq) => write!(f, "{}", cseq),
            HeaderValue::CallId(call_id) => write!(f, "{}", call_id),
            HeaderValue::Address(addr) => write!(f, "{}", addr),
            HeaderValue::UInt(n) => write!(f, "{}", n),
            HeaderValue::TokenList(tokens) => f.write_str(&tokens.join(", ")),
        }
    }
}

/// A single header: name plus raw-or-parsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// The normalized header name.
    pub name: HeaderName,
    /// The raw or parsed value.
    pub value: HeaderValue,
}

impl Header {
    /// A header carrying raw bytes.
    pub fn raw(name: HeaderName, value: impl Into<Vec<u8>>) -> Header {
        Header {
            name,
            value: HeaderValue::Raw(value.into()),
        }
    }

    /// A header carrying text (stored raw, parsed on demand).
    pub fn text(name: HeaderName, value: impl AsRef<str>) -> Header {
        Header::raw(name, value.as_ref().as_bytes().to_vec())
    }

    /// A header carrying an already-typed value.
    pub fn typed(name: HeaderName, value: HeaderValue) -> Header {
        Header { name, value }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}
