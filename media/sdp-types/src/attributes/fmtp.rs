//! Fmtp attribute (`a=fmtp`)

use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, identity, ws};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res};
use nom::error::context;
use std::fmt;
use std::str::FromStr;

/// Fmtp attribute (`a=fmtp`)
///
/// Format specific parameters for a payload number.
///
/// Media-Level attribute
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-6.15)
#[derive(Debug, Clone)]
pub struct Fmtp {
    /// The payload number the parameters apply to
    pub format: u8,

    /// The parameters, kept verbatim
    pub params: BytesStr,
}

impl Fmtp {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        context(
            "parsing fmtp",
            map(
                ws((map_res(digit1, FromStr::from_str), identity())),
                |(format, params): (_, &str)| Fmtp {
                    format,
                    params: BytesStr::from_parse(src, params.trim()),
                },
            ),
        )(i)
    }
}

impl fmt::Display for Fmtp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.format, self.params)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fmtp() {
        let input = BytesStr::from_static("101 0-16");

        let (rem, fmtp) = Fmtp::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(fmtp.format, 101);
        assert_eq!(fmtp.params, "0-16");
        assert_eq!(fmtp.to_string(), "101 0-16");
    }
}
