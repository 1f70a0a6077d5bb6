//! The Call-Id header.

use std::fmt;

/// A Call-Id value (RFC 3261 Section 8.1.1.4). Opaque to the core; it only
/// participates in loop detection and dialog identification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(pub String);

impl CallId {
    /// Wraps a Call-Id string.
    pub fn new(value: impl Into<String>) -> CallId {
        CallId(value.into())
    }

    /// The raw value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        CallId::new(s)
    }
}
