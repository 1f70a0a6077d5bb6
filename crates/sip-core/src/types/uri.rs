//! Request-URIs.
//!
//! The transaction core only needs URIs for routing and for copying into
//! derived requests (ACK, CANCEL), so `Uri` deliberately retains the raw
//! form instead of decomposing the full RFC 3261 grammar. Serialization
//! round-trips the original bytes exactly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A SIP URI kept in its raw textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri(String);

impl Uri {
    /// Wraps a raw URI string. The only structural check is a non-empty
    /// scheme followed by `:`, which is all the routing layer relies on.
    pub fn new(raw: impl Into<String>) -> Result<Uri, Error> {
        let raw = raw.into();
        let valid = raw
            .split_once(':')
            .map(|(scheme, rest)| {
                !scheme.is_empty()
                    && scheme
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
                    && !rest.is_empty()
            })
            .unwrap_or(false);
        if !valid || raw.contains(|c: char| c.is_ascii_whitespace()) {
            return Err(Error::InvalidStartLine(format!("invalid URI: {:?}", raw)));
        }
        Ok(Uri(raw))
    }

    /// Convenience constructor for `sip:` URIs.
    pub fn sip(rest: impl AsRef<str>) -> Uri {
        Uri(format!("sip:{}", rest.as_ref()))
    }

    /// The URI scheme (`sip`, `sips`, `tel`, ...), lowercased.
    pub fn scheme(&self) -> String {
        self.0.split(':').next().unwrap_or_default().to_ascii_lowercase()
    }

    /// The raw URI text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uri::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_urn_style_uris() {
        let uri = Uri::new("sip:urn:service:test").unwrap();
        assert_eq!(uri.scheme(), "sip");
        assert_eq!(uri.to_string(), "sip:urn:service:test");
    }

    #[test]
    fn rejects_junk() {
        assert!(Uri::new("").is_err());
        assert!(Uri::new("no-colon").is_err());
        assert!(Uri::new("sip:with space").is_err());
        assert!(Uri::new(":empty-scheme").is_err());
    }
}
