//! From/To style address headers.
//!
//! `Address` covers what the transaction and UA layers need from From, To,
//! Contact, Route and Record-Route values: an optional display name, the
//! URI, and header parameters — most importantly `tag`, which identifies
//! the dialog ends (RFC 3261 Section 8.2.6.2 and 19.3).

use std::fmt;

use crate::types::param::Params;
use crate::types::uri::Uri;

/// A name-addr / addr-spec with header parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Display name, unquoted.
    pub display_name: Option<String>,
    /// The address URI.
    pub uri: Uri,
    /// Header parameters following the address (`tag`, `expires`, ...).
    pub params: Params,
}

impl Address {
    /// An address with no display name and no parameters.
    pub fn new(uri: Uri) -> Address {
        Address {
            display_name: None,
            uri,
            params: Params::default(),
        }
    }

    /// Sets the display name, builder style.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Address {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the `tag` parameter, builder style.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Address {
        self.params.set("tag", Some(tag.into()));
        self
    }

    /// The `tag` parameter, if any.
    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag")
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            // Quote the display name whenever it is not a plain token run.
            if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_') {
                write!(f, "{} ", name)?;
            } else {
                write!(f, "\"{}\" ", name.replace('\\', "\\\\").replace('"', "\\\""))?;
            }
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_name_addr_with_tag() {
        let addr = Address::new(Uri::sip("alice@example.com"))
            .with_display_name("Alice")
            .with_tag("1928301774");
        assert_eq!(addr.to_string(), "Alice <sip:alice@example.com>;tag=1928301774");
        assert_eq!(addr.tag(), Some("1928301774"));
    }

    #[test]
    fn quotes_non_token_display_names() {
        let addr = Address::new(Uri::sip("bob@b.example")).with_display_name("Bob Builder");
        assert_eq!(addr.to_string(), "\"Bob Builder\" <sip:bob@b.example>");
    }

    #[test]
    fn tag_absent_by_default() {
        assert!(Address::new(Uri::sip("x@y")).tag().is_none());
    }
}
