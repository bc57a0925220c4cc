//! SDP parsing and serialization for the audio subset this stack
//! negotiates: `RTP/AVP` audio streams, rtpmap/fmtp/ptime/direction
//! attributes, IPv4 connections.

use internal::IResult;
use nom::character::complete::{char, digit1};
use nom::combinator::map_res;
use nom::sequence::preceded;
use std::str::FromStr;

mod attributes;
mod connection;
mod media;
mod media_description;
mod origin;
mod session_description;
mod tagged_address;

pub use attributes::{Direction, Fmtp, RtpMap, UnknownAttribute};
pub use connection::Connection;
pub use media::{Media, MediaType, TransportProtocol};
pub use media_description::MediaDescription;
pub use origin::Origin;
pub use session_description::{ParseSessionDescriptionError, SessionDescription};
pub use tagged_address::TaggedAddress;

fn slash_num(i: &str) -> IResult<'_, u32> {
    preceded(char('/'), map_res(digit1, FromStr::from_str))(i)
}

fn not_whitespace(c: char) -> bool {
    !c.is_ascii_whitespace()
}
