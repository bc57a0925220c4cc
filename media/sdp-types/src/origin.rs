use crate::{TaggedAddress, not_whitespace};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::take_while;
use nom::combinator::map;
use std::fmt;

/// Origin field (`o=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.2)
#[derive(Debug, Clone)]
pub struct Origin {
    pub username: BytesStr,

    /// Globally unique session identifier
    pub session_id: BytesStr,

    /// Version of the session, bumped with each renegotiation
    pub session_version: BytesStr,

    /// Source address of the message
    pub address: TaggedAddress,
}

impl Origin {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((
                take_while(not_whitespace),
                take_while(not_whitespace),
                take_while(not_whitespace),
                TaggedAddress::parse(src),
            )),
            |(username, session_id, session_version, address)| Origin {
                username: BytesStr::from_parse(src, username),
                session_id: BytesStr::from_parse(src, session_id),
                session_version: BytesStr::from_parse(src, session_version),
                address,
            },
        )(i)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "o={} {} {} {}",
            self.username, self.session_id, self.session_version, self.address
        )
    }
}
