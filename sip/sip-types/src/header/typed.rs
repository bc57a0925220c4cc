//! Typed representations of the headers the dialog layer inspects

use crate::method::Method;
use crate::uri::{Params, SipUri, parse_u32};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{Finish, IResult, ws};
use nom::bytes::complete::{tag, take_until, take_while1};
use nom::combinator::map;
use nom::sequence::tuple;
use std::fmt;

/// `CSeq` header: sequence number and method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub cseq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((parse_u32, Method::parse(src))),
            |(cseq, method)| CSeq { cseq, method },
        )(i)
    }

    pub fn from_value(value: &BytesStr) -> Option<Self> {
        Self::parse(value.as_ref(), value.as_str())
            .finish()
            .map(|(_, cseq)| cseq)
            .ok()
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.cseq, self.method)
    }
}

/// `RAck` header acknowledging a reliable provisional response (RFC 3262)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RAck {
    pub rack: u32,
    pub cseq: u32,
    pub method: Method,
}

impl RAck {
    pub fn new(rack: u32, cseq: u32, method: Method) -> Self {
        Self { rack, cseq, method }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((parse_u32, parse_u32, Method::parse(src))),
            |(rack, cseq, method)| RAck { rack, cseq, method },
        )(i)
    }

    pub fn from_value(value: &BytesStr) -> Option<Self> {
        Self::parse(value.as_ref(), value.as_str())
            .finish()
            .map(|(_, rack)| rack)
            .ok()
    }
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rack, self.cseq, self.method)
    }
}

/// `Via` header of the UDP-only profile: `SIP/2.0/UDP sent-by;params`
#[derive(Debug, Clone)]
pub struct Via {
    pub transport: BytesStr,
    pub sent_by: BytesStr,
    pub params: Params,
}

impl Via {
    pub fn new(sent_by: impl Into<BytesStr>, branch: impl Into<BytesStr>) -> Self {
        let mut params = Params::default();
        params.push("branch", Some(branch.into()));

        Self {
            transport: BytesStr::from_static("UDP"),
            sent_by: sent_by.into(),
            params,
        }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((
                tag("SIP"),
                tag("/"),
                take_until("/"),
                tag("/"),
                take_while1(|c: char| !c.is_ascii_whitespace()),
                take_while1(|c: char| !matches!(c, ';' | ',' | ' ' | '\t')),
                Params::parse(src),
            )),
            |(_, _, _, _, transport, sent_by, params)| Via {
                transport: BytesStr::from_parse(src, transport),
                sent_by: BytesStr::from_parse(src, sent_by),
                params,
            },
        )(i)
    }

    pub fn from_value(value: &BytesStr) -> Option<Self> {
        Self::parse(value.as_ref(), value.as_str())
            .finish()
            .map(|(_, via)| via)
            .ok()
    }

    pub fn branch(&self) -> Option<&BytesStr> {
        self.params.get("branch")
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}{}", self.transport, self.sent_by, self.params)
    }
}

/// From/To/Contact style header: optional display name, a URI and
/// trailing parameters such as `tag`
#[derive(Debug, Clone)]
pub struct NameAddr {
    pub display_name: Option<BytesStr>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::default(),
        }
    }

    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        let i = i.trim();

        if let Some(open) = i.find('<') {
            let display = i[..open].trim().trim_matches('"');
            let rest = &i[open + 1..];

            let (after, (uri, _)) = tuple((SipUri::parse(src), tag(">")))(rest)?;
            let (after, params) = Params::parse(src)(after)?;

            Ok((
                after,
                NameAddr {
                    display_name: (!display.is_empty())
                        .then(|| BytesStr::from_parse(src, display)),
                    uri,
                    params,
                },
            ))
        } else {
            let (after, uri) = SipUri::parse(src)(i)?;
            // without angle brackets trailing parameters belong to the
            // header, not the URI
            let mut uri = uri;
            let params = std::mem::take(&mut uri.params);

            Ok((
                after,
                NameAddr {
                    display_name: None,
                    uri,
                    params,
                },
            ))
        }
    }

    pub fn from_value(value: &BytesStr) -> Option<Self> {
        Self::parse(value.as_ref(), value.as_str())
            .finish()
            .map(|(_, addr)| addr)
            .ok()
    }

    pub fn tag(&self) -> Option<&BytesStr> {
        self.params.get("tag")
    }

    pub fn set_tag(&mut self, tag: impl Into<BytesStr>) {
        if !self.params.contains("tag") {
            self.params.push("tag", Some(tag.into()));
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "\"{display_name}\" ")?;
        }

        write!(f, "<{}>{}", self.uri, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cseq() {
        let value = BytesStr::from_static("314159 INVITE");
        let cseq = CSeq::from_value(&value).unwrap();

        assert_eq!(cseq.cseq, 314159);
        assert_eq!(cseq.method, Method::INVITE);
        assert_eq!(cseq.to_string(), "314159 INVITE");
    }

    #[test]
    fn rack() {
        let value = BytesStr::from_static("42 1 INVITE");
        let rack = RAck::from_value(&value).unwrap();

        assert_eq!(rack.rack, 42);
        assert_eq!(rack.cseq, 1);
        assert_eq!(rack.to_string(), "42 1 INVITE");
    }

    #[test]
    fn via() {
        let value = BytesStr::from_static("SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKkdjuw");
        let via = Via::from_value(&value).unwrap();

        assert_eq!(via.transport, "UDP");
        assert_eq!(via.sent_by, "192.0.2.1:5060");
        assert_eq!(via.branch().unwrap(), "z9hG4bKkdjuw");
        assert_eq!(
            via.to_string(),
            "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKkdjuw"
        );
    }

    #[test]
    fn name_addr_with_display() {
        let value = BytesStr::from_static("\"Bob\" <sip:bob@biloxi.example.com>;tag=a73kszlfl");
        let addr = NameAddr::from_value(&value).unwrap();

        assert_eq!(addr.display_name.as_ref().unwrap(), "Bob");
        assert_eq!(addr.uri.user.as_ref().unwrap(), "bob");
        assert_eq!(addr.tag().unwrap(), "a73kszlfl");
    }

    #[test]
    fn name_addr_bare_uri() {
        let value = BytesStr::from_static("sip:caller@example.org;tag=33242");
        let addr = NameAddr::from_value(&value).unwrap();

        assert_eq!(addr.display_name, None);
        assert_eq!(addr.uri.user.as_ref().unwrap(), "caller");
        assert!(addr.uri.params.is_empty());
        assert_eq!(addr.tag().unwrap(), "33242");
    }

    #[test]
    fn name_addr_print() {
        let mut addr = NameAddr::new(SipUri::new(Some("mrf".into()), "10.0.0.1", Some(5060)));
        addr.set_tag("abcd");

        assert_eq!(addr.to_string(), "<sip:mrf@10.0.0.1:5060>;tag=abcd");
    }
}
