//! Header value parsers.
//!
//! Raw header bytes are upgraded to typed values on demand via
//! [`parse_header_value`]. Only the headers the transaction core routes on
//! get real grammars (Via, CSeq, Call-Id, From/To, the numeric headers and
//! the token lists); everything else stays raw.
//!
//! The grammars are nom combinators over `&str` — header values are ASCII
//! per RFC 3261, so a UTF-8 check up front is safe.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace0, space0, space1},
    combinator::{all_consuming, map, map_res, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, separated_pair, tuple},
    IResult,
};

use crate::error::{Error, Result};
use crate::types::{
    Address, CallId, CSeq, HeaderName, HeaderValue, Method, Params, Uri, ViaEntry,
};

/// Parses a raw header value into its typed form.
///
/// Idempotent: an already-parsed value is passed through unchanged, so
/// callers can invoke this without tracking parse state. Headers without a
/// dedicated grammar come back as their raw bytes.
pub fn parse_header_value(name: &HeaderName, value: &HeaderValue) -> Result<HeaderValue> {
    let raw = match value {
        HeaderValue::Raw(bytes) => bytes,
        already_parsed => return Ok(already_parsed.clone()),
    };
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::invalid_header(name.as_str(), "value is not valid UTF-8"))?;
    let text = text.trim();

    match name {
        HeaderName::Via => parse_via(text).map(HeaderValue::Via),
        HeaderName::CSeq => parse_cseq(text).map(HeaderValue::CSeq),
        HeaderName::CallId => Ok(HeaderValue::CallId(CallId::new(text))),
        HeaderName::From | HeaderName::To | HeaderName::Contact => {
            parse_address(text).map(HeaderValue::Address)
        }
        HeaderName::ContentLength | HeaderName::MaxForwards | HeaderName::Expires => {
            parse_uint(name, text).map(HeaderValue::UInt)
        }
        HeaderName::Require
        | HeaderName::Supported
        | HeaderName::Unsupported
        | HeaderName::Allow => Ok(HeaderValue::TokenList(parse_token_list(text))),
        _ => Ok(value.clone()),
    }
}

/// Parses a Via header value: one or more comma-separated entries, each
/// `SIP/2.0/<transport> host[:port][;params]`. A missing or malformed
/// sent-protocol is fatal for the message per the codec failure policy.
pub fn parse_via(text: &str) -> Result<Vec<ViaEntry>> {
    match all_consuming(separated_list1(list_separator, via_entry))(text) {
        Ok((_, entries)) => Ok(entries),
        Err(_) => Err(Error::invalid_header("Via", format!("malformed value: {:?}", text))),
    }
}

/// Parses a CSeq value: `<sequence> <method>`.
pub fn parse_cseq(text: &str) -> Result<CSeq> {
    let parsed: IResult<&str, (u32, &str)> = all_consuming(separated_pair(
        map_res(digit1, str::parse::<u32>),
        space1,
        take_while1(|c: char| !c.is_ascii_whitespace()),
    ))(text);
    match parsed {
        Ok((_, (seq, method))) => {
            let method = method
                .parse::<Method>()
                .map_err(|_| Error::invalid_header("CSeq", format!("bad method: {:?}", method)))?;
            Ok(CSeq::new(seq, method))
        }
        Err(_) => Err(Error::invalid_header("CSeq", format!("malformed value: {:?}", text))),
    }
}

/// Parses a From/To/Contact style address: optional display name, the URI
/// (angle-bracketed or bare), then header parameters.
pub fn parse_address(text: &str) -> Result<Address> {
    match all_consuming(address)(text) {
        Ok((_, addr)) => Ok(addr),
        Err(_) => Err(Error::invalid_header("From/To", format!("malformed value: {:?}", text))),
    }
}

fn parse_uint(name: &HeaderName, text: &str) -> Result<u32> {
    text.parse::<u32>()
        .map_err(|_| Error::invalid_header(name.as_str(), format!("not a number: {:?}", text)))
}

fn parse_token_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ---- nom grammars ----

fn list_separator(input: &str) -> IResult<&str, ()> {
    map(tuple((multispace0, char(','), multispace0)), |_| ())(input)
}

fn via_entry(input: &str) -> IResult<&str, ViaEntry> {
    let (input, _) = tuple((tag("SIP"), char('/'), tag("2.0"), char('/')))(input)?;
    let (input, transport) = take_while1(|c: char| c.is_ascii_alphanumeric())(input)?;
    let (input, _) = space1(input)?;
    let (input, host) = host(input)?;
    let (input, port) = opt(preceded(char(':'), map_res(digit1, str::parse::<u16>)))(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        ViaEntry {
            transport: transport.to_ascii_uppercase(),
            sent_by_host: host.to_string(),
            sent_by_port: port,
            params,
        },
    ))
}

fn host(input: &str) -> IResult<&str, &str> {
    alt((
        // bracketed IPv6 reference, brackets included
        nom::combinator::recognize(delimited(
            char('['),
            take_while1(|c: char| c.is_ascii_hexdigit() || c == ':' || c == '.'),
            char(']'),
        )),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'),
    ))(input)
}

fn params(input: &str) -> IResult<&str, Params> {
    map(
        many0(preceded(tuple((space0, char(';'), space0)), param)),
        |pairs| pairs.into_iter().collect::<Params>(),
    )(input)
}

fn param(input: &str) -> IResult<&str, (String, Option<String>)> {
    let (input, name) = param_token(input)?;
    let (input, value) = opt(preceded(char('='), param_token))(input)?;
    Ok((input, (name.to_string(), value.map(str::to_string))))
}

fn param_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| {
        c.is_ascii_alphanumeric() || "-.!%*_+`'~[]:/".contains(c)
    })(input)
}

fn address(input: &str) -> IResult<&str, Address> {
    let (input, _) = space0(input)?;
    let (input, addr) = alt((name_addr, addr_spec))(input)?;
    let (input, params) = params(input)?;
    let (input, _) = space0(input)?;
    Ok((
        input,
        Address {
            display_name: addr.0,
            uri: addr.1,
            params,
        },
    ))
}

type BareAddress = (Option<String>, Uri);

fn name_addr(input: &str) -> IResult<&str, BareAddress> {
    let (input, display) = opt(display_name)(input)?;
    let (input, _) = space0(input)?;
    let (input, uri_text) = delimited(char('<'), take_while1(|c| c != '>'), char('>'))(input)?;
    let uri = Uri::new(uri_text)
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((input, (display.flatten(), uri)))
}

fn addr_spec(input: &str) -> IResult<&str, BareAddress> {
    let (input, uri_text) = take_while1(|c: char| c != ';' && c != ',' && !c.is_ascii_whitespace())(input)?;
    let uri = Uri::new(uri_text)
        .map_err(|_| nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))?;
    Ok((input, (None, uri)))
}

fn display_name(input: &str) -> IResult<&str, Option<String>> {
    alt((
        map(quoted_string, |s| Some(unescape(s))),
        map(token_phrase, |s: &str| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }),
    ))(input)
}

fn quoted_string(input: &str) -> IResult<&str, &str> {
    delimited(
        char('"'),
        nom::combinator::recognize(many0(alt((
            nom::combinator::recognize(pair(char('\\'), nom::character::complete::anychar)),
            take_while1(|c| c != '"' && c != '\\'),
        )))),
        char('"'),
    )(input)
}

// A run of tokens and spaces ending before '<'.
fn token_phrase(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c.is_ascii_alphanumeric() || " -._%!*+`'~".contains(c))(input)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn via_single_entry() {
        let entries = parse_via("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-abc").unwrap();
        assert_eq!(entries.len(), 1);
        let via = &entries[0];
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.sent_by_host, "10.0.0.1");
        assert_eq!(via.sent_by_port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK-abc"));
    }

    #[test]
    fn via_comma_separated_entries_keep_order() {
        let entries = parse_via(
            "SIP/2.0/UDP first.example.com;branch=z9hG4bK-1, SIP/2.0/TCP second.example.com:5061;branch=z9hG4bK-2",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sent_by_host, "first.example.com");
        assert_eq!(entries[1].sent_by_host, "second.example.com");
        assert_eq!(entries[1].transport, "TCP");
    }

    #[test]
    fn via_without_sent_protocol_is_fatal() {
        assert!(parse_via("UDP 10.0.0.1:5060").is_err());
        assert!(parse_via("SIP/2.0 10.0.0.1").is_err());
    }

    #[test]
    fn via_ipv6_host() {
        let entries = parse_via("SIP/2.0/UDP [2001:db8::1]:5060;branch=z9hG4bK-v6").unwrap();
        assert_eq!(entries[0].sent_by_host, "[2001:db8::1]");
        assert_eq!(entries[0].sent_by_port, Some(5060));
    }

    #[test]
    fn via_rport_without_value() {
        let entries = parse_via("SIP/2.0/UDP a.example.com;rport;branch=z9hG4bK-r").unwrap();
        assert!(entries[0].params.contains("rport"));
        assert_eq!(entries[0].branch(), Some("z9hG4bK-r"));
    }

    #[test]
    fn cseq_parses() {
        assert_eq!(parse_cseq("101 INVITE").unwrap(), CSeq::new(101, Method::Invite));
        assert!(parse_cseq("abc INVITE").is_err());
        assert!(parse_cseq("101").is_err());
    }

    #[test]
    fn address_name_addr_with_tag() {
        let addr = parse_address("Alice <sip:alice@example.com>;tag=88sja8x").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.as_str(), "sip:alice@example.com");
        assert_eq!(addr.tag(), Some("88sja8x"));
    }

    #[test]
    fn address_quoted_display_name() {
        let addr = parse_address("\"A. G. Bell\" <sip:agb@bell-telephone.com>;tag=a48s").unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("A. G. Bell"));
    }

    #[test]
    fn address_bare_addr_spec() {
        let addr = parse_address("sip:bob@biloxi.example.com;tag=8321234356").unwrap();
        assert!(addr.display_name.is_none());
        assert_eq!(addr.uri.as_str(), "sip:bob@biloxi.example.com");
        assert_eq!(addr.tag(), Some("8321234356"));
    }

    #[test]
    fn idempotent_parse() {
        let raw = HeaderValue::Raw(b"70".to_vec());
        let once = parse_header_value(&HeaderName::MaxForwards, &raw).unwrap();
        assert_eq!(once, HeaderValue::UInt(70));
        let twice = parse_header_value(&HeaderName::MaxForwards, &once).unwrap();
        assert_eq!(twice, HeaderValue::UInt(70));
    }

    #[test]
    fn unknown_headers_stay_raw() {
        let raw = HeaderValue::Raw(b"whatever".to_vec());
        let parsed = parse_header_value(&HeaderName::Other("x-custom".into()), &raw).unwrap();
        assert_eq!(parsed, raw);
    }

    #[test]
    fn token_lists_split_and_trim() {
        let raw = HeaderValue::Raw(b"100rel , timer,foo".to_vec());
        match parse_header_value(&HeaderName::Require, &raw).unwrap() {
            HeaderValue::TokenList(tokens) => assert_eq!(tokens, vec!["100rel", "timer", "foo"]),
            other => panic!("expected token list, got {:?}", other),
        }
    }
}
