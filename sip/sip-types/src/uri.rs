use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map, map_res, opt};
use nom::error::context;
use nom::multi::many0;
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;
use std::str::FromStr;

fn user_char(c: char) -> bool {
    c.is_alphanumeric()
        || matches!(
            c,
            '-' | '_' | '.' | '!' | '~' | '*' | '\'' | '(' | ')' | '&' | '=' | '+' | '$' | ',' | '%'
        )
}

fn host_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '.' | '[' | ']' | ':')
}

fn param_char(c: char) -> bool {
    !matches!(c, ';' | '=' | '?' | '>' | ' ' | '\t' | '\r' | '\n')
}

/// `;key[=value]` parameter list trailing URIs, Via and From/To values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<(BytesStr, Option<BytesStr>)>);

impl Params {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<'_, Self> + '_ {
        move |i| {
            map(
                many0(preceded(
                    char(';'),
                    tuple((
                        take_while1(param_char),
                        opt(preceded(char('='), take_while(param_char))),
                    )),
                )),
                |params| {
                    Params(
                        params
                            .into_iter()
                            .map(|(key, value)| {
                                (
                                    BytesStr::from_parse(src, key),
                                    value.map(|v| BytesStr::from_parse(src, v)),
                                )
                            })
                            .collect(),
                    )
                },
            )(i)
        }
    }

    pub fn get(&self, key: &str) -> Option<&BytesStr> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str().eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k.as_str().eq_ignore_ascii_case(key))
    }

    pub fn push(&mut self, key: impl Into<BytesStr>, value: Option<BytesStr>) {
        self.0.push((key.into(), value));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.0 {
            match value {
                Some(value) => write!(f, ";{key}={value}")?,
                None => write!(f, ";{key}")?,
            }
        }

        Ok(())
    }
}

/// A `sip:` URI of the shape `sip:user@host:port;params`
///
/// Password and URI headers are not carried; the routing decisions of
/// this stack only ever look at the user part and the host/port.
#[derive(Debug, Clone, PartialEq)]
pub struct SipUri {
    pub user: Option<BytesStr>,
    pub host: BytesStr,
    pub port: Option<u16>,
    pub params: Params,
}

impl SipUri {
    pub fn new(user: Option<BytesStr>, host: impl Into<BytesStr>, port: Option<u16>) -> Self {
        Self {
            user,
            host: host.into(),
            port,
            params: Params::default(),
        }
    }

    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<'_, Self> + '_ {
        move |i| {
            context(
                "parsing sip uri",
                map(
                    tuple((
                        alt((tag_no_case("sips:"), tag_no_case("sip:"))),
                        opt(terminated(take_while1(user_char), char('@'))),
                        take_while1(host_char),
                        Params::parse(src),
                    )),
                    |(_, user, host_port, params)| {
                        let (host, port) = split_host_port(host_port);

                        SipUri {
                            user: user.map(|u| BytesStr::from_parse(src, u)),
                            host: BytesStr::from_parse(src, host),
                            port,
                            params,
                        }
                    },
                ),
            )(i)
        }
    }

    /// The user part with any `user=phone` style parameters stripped
    pub fn user_str(&self) -> &str {
        self.user.as_ref().map(BytesStr::as_str).unwrap_or("")
    }
}

fn split_host_port(host_port: &str) -> (&str, Option<u16>) {
    // IPv6 references carry colons inside brackets
    if let Some(end) = host_port.rfind(']') {
        match host_port[end..].find(':') {
            Some(colon) => {
                let port = host_port[end + colon + 1..].parse().ok();
                (&host_port[..end + colon], port)
            }
            None => (host_port, None),
        }
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()),
            None => (host_port, None),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sip:")?;

        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }

        f.write_str(&self.host)?;

        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }

        write!(f, "{}", self.params)
    }
}

/// CSeq parse helper shared by typed headers
pub(crate) fn parse_u32(i: &str) -> IResult<'_, u32> {
    map_res(digit1, u32::from_str)(i)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_uri() {
        let input = BytesStr::from_static("sip:alice@example.com:5080;user=phone");

        let (rem, uri) = SipUri::parse(input.as_ref())(&input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(uri.user.as_ref().unwrap(), "alice");
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5080));
        assert!(uri.params.contains("user"));
    }

    #[test]
    fn minimal_uri() {
        let input = BytesStr::from_static("sip:192.0.2.5");

        let (_, uri) = SipUri::parse(input.as_ref())(&input).unwrap();

        assert_eq!(uri.user, None);
        assert_eq!(uri.host, "192.0.2.5");
        assert_eq!(uri.port, None);
    }

    #[test]
    fn print() {
        let uri = SipUri::new(Some("33001".into()), "10.0.0.1", Some(5060));
        assert_eq!(uri.to_string(), "sip:33001@10.0.0.1:5060");
    }
}
