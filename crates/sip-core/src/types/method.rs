//! SIP request methods.
//!
//! Methods identify the purpose of a request (RFC 3261 Section 7.1). The
//! transaction layer cares most about the INVITE/non-INVITE distinction and
//! about ACK and CANCEL, which have special matching rules.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A SIP request method.
///
/// The RFC 3261 core methods plus the common extension methods are first
/// class variants; anything else round-trips through `Extension`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// INVITE — initiate a session (RFC 3261)
    Invite,
    /// ACK — acknowledge a final response to INVITE (RFC 3261)
    Ack,
    /// BYE — terminate a session (RFC 3261)
    Bye,
    /// CANCEL — cancel a pending request (RFC 3261)
    Cancel,
    /// REGISTER — bind an address-of-record (RFC 3261)
    Register,
    /// OPTIONS — query capabilities (RFC 3261)
    Options,
    /// MESSAGE — instant message (RFC 3428)
    Message,
    /// SUBSCRIBE — subscribe to an event package (RFC 6665)
    Subscribe,
    /// NOTIFY — event notification (RFC 6665)
    Notify,
    /// REFER — call transfer (RFC 3515)
    Refer,
    /// INFO — mid-dialog information (RFC 6086)
    Info,
    /// UPDATE — update session state before the final response (RFC 3311)
    Update,
    /// PRACK — acknowledge a reliable provisional response (RFC 3262)
    Prack,
    /// Any other token used as a method.
    Extension(String),
}

impl Method {
    /// Canonical wire form of the method.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Extension(s) => s,
        }
    }

    /// True for INVITE. The transaction layer selects the INVITE state
    /// machines on this.
    pub fn is_invite(&self) -> bool {
        *self == Method::Invite
    }

    /// The method used for server transaction matching: ACK matches the
    /// INVITE transaction it acknowledges (RFC 3261 Section 17.2.3).
    pub fn for_server_matching(&self) -> Method {
        match self {
            Method::Ack => Method::Invite,
            other => other.clone(),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(is_token_char) {
            return Err(crate::error::Error::InvalidStartLine(format!(
                "invalid method token: {:?}",
                s
            )));
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            other => Method::Extension(other.to_string()),
        })
    }
}

// token per RFC 3261 Section 25.1
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_methods() {
        assert_eq!(Method::from_str("INVITE").unwrap(), Method::Invite);
        assert_eq!(Method::from_str("ACK").unwrap(), Method::Ack);
        assert_eq!(Method::from_str("CANCEL").unwrap(), Method::Cancel);
    }

    #[test]
    fn extension_methods_round_trip() {
        let m = Method::from_str("PUBLISH").unwrap();
        assert_eq!(m, Method::Extension("PUBLISH".to_string()));
        assert_eq!(m.to_string(), "PUBLISH");
    }

    #[test]
    fn rejects_non_token_methods() {
        assert!(Method::from_str("").is_err());
        assert!(Method::from_str("IN VITE").is_err());
    }

    #[test]
    fn ack_matches_as_invite() {
        assert_eq!(Method::Ack.for_server_matching(), Method::Invite);
        assert_eq!(Method::Cancel.for_server_matching(), Method::Cancel);
        assert_eq!(Method::Bye.for_server_matching(), Method::Bye);
    }
}
