use crate::TaggedAddress;
use bytes::Bytes;
use internal::IResult;
use std::fmt;
use std::net::Ipv4Addr;

/// Connection field (`c=`)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.7)
#[derive(Debug, Clone)]
pub struct Connection {
    pub address: TaggedAddress,
}

impl Connection {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        let (i, address) = TaggedAddress::parse(src)(i)?;
        Ok((i, Connection { address }))
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.address.ipv4()
    }

    /// A `0.0.0.0` connection puts the stream on hold (RFC 3264 style)
    pub fn is_unspecified(&self) -> bool {
        self.ipv4().is_some_and(|ip| ip.is_unspecified())
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c={}", self.address)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytesstr::BytesStr;

    #[test]
    fn connection() {
        let input = BytesStr::from_static("IN IP4 10.0.0.5");

        let (_, conn) = Connection::parse(input.as_ref(), &input).unwrap();

        assert_eq!(conn.ipv4(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!conn.is_unspecified());
        assert_eq!(conn.to_string(), "c=IN IP4 10.0.0.5");
    }

    #[test]
    fn hold_connection() {
        let input = BytesStr::from_static("IN IP4 0.0.0.0");

        let (_, conn) = Connection::parse(input.as_ref(), &input).unwrap();

        assert!(conn.is_unspecified());
    }
}
