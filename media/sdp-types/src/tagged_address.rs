use crate::not_whitespace;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::{tag, take_while1};
use nom::combinator::map;
use std::fmt;
use std::net::Ipv4Addr;

/// `<nettype> <addrtype> <address>` triple used by origin and
/// connection fields
#[derive(Debug, Clone)]
pub enum TaggedAddress {
    /// `IN IP4` with a literal address
    Ip4(Ipv4Addr),

    /// `IN IP4` with a hostname
    Ip4Fqdn(BytesStr),

    /// Any other nettype/addrtype combination, kept verbatim
    Other {
        nettype: BytesStr,
        addrtype: BytesStr,
        address: BytesStr,
    },
}

impl TaggedAddress {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<'_, Self> + '_ {
        move |i| {
            if let Ok((i, (_, _, address))) = ws::<_, nom::error::VerboseError<&str>, _>((
                tag("IN"),
                tag("IP4"),
                take_while1(not_whitespace),
            ))(i)
            {
                let tagged = match address.parse::<Ipv4Addr>() {
                    Ok(ip) => TaggedAddress::Ip4(ip),
                    Err(_) => TaggedAddress::Ip4Fqdn(BytesStr::from_parse(src, address)),
                };
                return Ok((i, tagged));
            }

            map(
                ws((
                    take_while1(not_whitespace),
                    take_while1(not_whitespace),
                    take_while1(not_whitespace),
                )),
                |(nettype, addrtype, address)| TaggedAddress::Other {
                    nettype: BytesStr::from_parse(src, nettype),
                    addrtype: BytesStr::from_parse(src, addrtype),
                    address: BytesStr::from_parse(src, address),
                },
            )(i)
        }
    }

    /// Literal IPv4 address, if this is one
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            TaggedAddress::Ip4(ip) => Some(*ip),
            _ => None,
        }
    }
}

impl fmt::Display for TaggedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaggedAddress::Ip4(ip) => write!(f, "IN IP4 {ip}"),
            TaggedAddress::Ip4Fqdn(host) => write!(f, "IN IP4 {host}"),
            TaggedAddress::Other {
                nettype,
                addrtype,
                address,
            } => write!(f, "{nettype} {addrtype} {address}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ip4_literal() {
        let input = BytesStr::from_static("IN IP4 192.168.123.222");

        let (rem, addr) = TaggedAddress::parse(input.as_ref())(&input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(addr.ipv4(), Some(Ipv4Addr::new(192, 168, 123, 222)));
        assert_eq!(addr.to_string(), "IN IP4 192.168.123.222");
    }

    #[test]
    fn ip4_fqdn() {
        let input = BytesStr::from_static("IN IP4 media.example.com");

        let (_, addr) = TaggedAddress::parse(input.as_ref())(&input).unwrap();

        assert!(addr.ipv4().is_none());
        assert_eq!(addr.to_string(), "IN IP4 media.example.com");
    }

    #[test]
    fn other() {
        let input = BytesStr::from_static("IN IP6 ::1");

        let (_, addr) = TaggedAddress::parse(input.as_ref())(&input).unwrap();

        assert!(addr.ipv4().is_none());
        assert_eq!(addr.to_string(), "IN IP6 ::1");
    }
}
