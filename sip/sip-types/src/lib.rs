//! SIP message types, parsing and serialization for the UDP profile of
//! this stack.
//!
//! The central type is [`SipMessage`]: [`SipMessage::parse_one`] consumes
//! exactly one PDU from a datagram (returning the remainder, since UDP
//! peers may concatenate messages) and extracts the base headers every
//! layer above needs. [`SipMessage::serialize`] emits the canonical
//! header order and assembles single-part or multipart bodies.

mod body;
mod code;
mod method;
mod msg;
mod uri;

pub mod header;

pub use body::{BodyType, ContentPart, MessageBody, MULTIPART_BOUNDARY};
pub use code::{CodeKind, StatusCode};
pub use header::headers::Headers;
pub use header::name::Name;
pub use method::Method;
pub use header::typed::{CSeq, NameAddr, RAck, Via};
pub use msg::{
    Incomplete, Line, MessageLine, ParseSipMessageError, PullParser, RequestLine, SipMessage,
    StatusLine,
};
pub use uri::{Params, SipUri};
