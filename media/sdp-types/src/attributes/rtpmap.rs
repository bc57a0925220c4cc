//! RtpMap attribute (`a=rtpmap`)

use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{IResult, ws};
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::digit1;
use nom::combinator::{map, map_res, opt};
use nom::error::context;
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;
use std::str::FromStr;

/// Rtpmap attribute (`a=rtpmap`)
///
/// Map a RTP payload number specified in the media description to an encoding.
///
/// Media-Level attribute
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-6.6)
#[derive(Debug, Clone)]
pub struct RtpMap {
    /// The number used in the media description which this maps a description to
    pub payload: u8,

    /// Name of the encoding
    pub encoding: BytesStr,

    /// Clock rate of the encoding
    pub clock_rate: u32,

    /// Additional parameters as a string, for audio the channel count
    pub params: Option<BytesStr>,
}

impl RtpMap {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        context(
            "parsing rtpmap",
            map(
                tuple((
                    // payload num
                    map_res(digit1, FromStr::from_str),
                    // encoding
                    ws((terminated(
                        map(take_while(|c| c != '/'), |slice| {
                            BytesStr::from_parse(src, slice)
                        }),
                        tag("/"),
                    ),)),
                    // clock rate
                    map_res(digit1, FromStr::from_str),
                    // optional params
                    opt(preceded(tag("/"), |rem| {
                        Ok(("", BytesStr::from_parse(src, rem)))
                    })),
                )),
                |(payload, (encoding,), clock_rate, params)| RtpMap {
                    payload,
                    encoding,
                    clock_rate,
                    params,
                },
            ),
        )(i)
    }

    /// Audio channel count, which defaults to 1 when omitted
    pub fn channels(&self) -> u32 {
        self.params
            .as_ref()
            .and_then(|p| p.as_str().parse().ok())
            .unwrap_or(1)
    }

    /// Case-insensitive match on the encoding name
    pub fn is_encoding(&self, name: &str) -> bool {
        self.encoding.as_str().eq_ignore_ascii_case(name)
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.payload, self.encoding, self.clock_rate)?;

        if let Some(params) = &self.params {
            let _ = write!(f, "/{params}");
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rtpmap() {
        let input = BytesStr::from_static("0 PCMU/8000");

        let (rem, rtpmap) = RtpMap::parse(input.as_ref(), &input).unwrap();

        assert!(rem.is_empty());
        assert_eq!(rtpmap.payload, 0);
        assert_eq!(rtpmap.encoding, "PCMU");
        assert_eq!(rtpmap.clock_rate, 8000);
        assert_eq!(rtpmap.params, None);
        assert_eq!(rtpmap.channels(), 1);
    }

    #[test]
    fn rtpmap_channels() {
        let input = BytesStr::from_static("0 PCMU/8000/2");

        let (_, rtpmap) = RtpMap::parse(input.as_ref(), &input).unwrap();

        assert_eq!(rtpmap.channels(), 2);
    }

    #[test]
    fn telephone_event() {
        let input = BytesStr::from_static("101 telephone-event/8000");

        let (_, rtpmap) = RtpMap::parse(input.as_ref(), &input).unwrap();

        assert_eq!(rtpmap.payload, 101);
        assert!(rtpmap.is_encoding("TELEPHONE-EVENT"));
    }

    #[test]
    fn rtpmap_print() {
        let rtpmap = RtpMap {
            payload: 9,
            encoding: "G722".into(),
            clock_rate: 8000,
            params: None,
        };

        assert_eq!(rtpmap.to_string(), "9 G722/8000");
    }
}
