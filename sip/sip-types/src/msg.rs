//! SIP message framing, parsing and serialization

use crate::body::MessageBody;
use crate::code::StatusCode;
use crate::header::headers::Headers;
use crate::header::name::Name;
use crate::header::typed::{CSeq, NameAddr, Via};
use crate::method::Method;
use crate::uri::SipUri;
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{Finish, IResult, ws};
use memchr::memchr2;
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, map_res, opt};
use std::fmt;
use std::str::FromStr;

fn token(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '`' | '\'' | '~' | '+')
}

fn not_newline(c: char) -> bool {
    !matches!(c, '\n' | '\r')
}

/// Represents a `header-name: header-value` line inside a message
pub struct Line {
    pub name: Name,
    pub value: BytesStr,
}

impl Line {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((take_while1(token), char(':'), |i| Ok(("", i)))),
            |(name, _, value): (&str, _, &str)| Line {
                name: BytesStr::from_parse(src, name).into(),
                value: BytesStr::from_parse(src, value.trim()),
            },
        )(i)
    }
}

/// The leading line of a SIP request message
#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((Method::parse(src), SipUri::parse(src), tag("SIP/2.0"))),
            |(method, uri, _)| RequestLine { method, uri },
        )(i)
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// The leading line of a SIP response message
#[derive(Debug, Clone)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Option<BytesStr>,
}

impl StatusLine {
    fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        map(
            ws((
                tag("SIP/2.0"),
                map_res(take_while1(|c: char| c.is_ascii_digit()), u16::from_str),
                opt(take_while(not_newline)),
            )),
            |(_, code, reason): (_, _, Option<&str>)| StatusLine {
                code: StatusCode::from(code),
                reason: reason.and_then(|reason| match reason.trim() {
                    "" => None,
                    s => Some(BytesStr::from_parse(src, s)),
                }),
            },
        )(i)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code)?;

        if let Some(reason) = &self.reason {
            write!(f, " {reason}")?;
        }

        Ok(())
    }
}

/// The leading line of any SIP message
#[derive(Debug, Clone)]
pub enum MessageLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl MessageLine {
    pub fn parse<'i>(src: &Bytes, i: &'i str) -> IResult<'i, Self> {
        alt((
            map(|i| StatusLine::parse(src, i), MessageLine::Response),
            map(|i| RequestLine::parse(src, i), MessageLine::Request),
        ))(i)
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(..))
    }

    pub fn request_method(&self) -> Option<&Method> {
        match self {
            MessageLine::Request(line) => Some(&line.method),
            MessageLine::Response(_) => None,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            MessageLine::Request(_) => None,
            MessageLine::Response(line) => Some(line.code),
        }
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLine::Request(line) => line.fmt(f),
            MessageLine::Response(line) => line.fmt(f),
        }
    }
}

/// semi-error type that just signals that the input is incomplete
#[derive(Debug, PartialEq, Eq)]
pub struct Incomplete(());

/// Simple pull parser which returns all lines in a SIP message head.
///
/// Lines are terminated with either `\n` or `\r\n` followed by anything
/// but a whitespace, which is the SIP folding feature allowing
/// multi-line headers.
#[derive(Clone)]
pub struct PullParser<'i> {
    input: &'i [u8],
    progress: usize,
}

impl<'i> PullParser<'i> {
    pub fn new(input: &'i [u8], progress: usize) -> Self {
        Self { input, progress }
    }

    /// Returns the index of the first byte after the message-head.
    /// Only valid after the parser returned None.
    pub fn head_end(&self) -> usize {
        match self.input[self.progress..] {
            [b'\r', b'\n', b'\r', b'\n', ..] => self.progress + 4,
            [b'\n', b'\n', ..] => self.progress + 2,
            _ => self.progress,
        }
    }
}

impl<'i> Iterator for PullParser<'i> {
    type Item = Result<&'i [u8], Incomplete>;

    fn next(&mut self) -> Option<Self::Item> {
        let line_begin = self.progress;

        let mut skip = 0;

        loop {
            let progress = match memchr2(b'\n', b'\r', &self.input[line_begin + skip..]) {
                None => return Some(Err(Incomplete(()))),
                Some(progress) => progress,
            };

            let pos = progress + line_begin + skip;

            match self.input[pos..] {
                [b'\n', b' ' | b'\t', ..] | [b'\r', b'\n', b' ' | b'\t', ..] => {
                    // whitespace after newline means its not a new line
                    skip += progress + 1;
                }
                [b'\n', b, ..] => {
                    let slice = &self.input[line_begin..pos];

                    if slice.is_empty() {
                        return None;
                    }

                    if b == b'\n' {
                        self.progress = pos;
                    } else {
                        self.progress = pos + 1;
                    }

                    return Some(Ok(slice));
                }
                [b'\r', b'\n', b1, b2, ..] => {
                    let slice = &self.input[line_begin..pos];

                    if slice.is_empty() {
                        return None;
                    }

                    if b1 == b'\r' && b2 == b'\n' {
                        self.progress = pos;
                    } else {
                        self.progress = pos + 2;
                    }

                    return Some(Ok(slice));
                }
                _ => {
                    // missing data after a newline, the head is incomplete
                    return Some(Err(Incomplete(())));
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseSipMessageError {
    #[error("message head is incomplete")]
    Incomplete,
    #[error("message head is not valid utf8")]
    InvalidUtf8,
    #[error("invalid start line")]
    InvalidStartLine,
    #[error("invalid header line")]
    InvalidHeaderLine,
    #[error("body is shorter than the announced content-length")]
    BodyIncomplete,
}

/// A complete SIP message, either parsed from the wire or under
/// construction for sending.
///
/// The base fields below the headers are extracted on parse so the
/// layers above never re-scan the header map for them.
#[derive(Debug)]
pub struct SipMessage {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: MessageBody,

    pub call_id: Option<BytesStr>,
    pub from: Option<NameAddr>,
    pub to: Option<NameAddr>,
    pub via_branch: Option<BytesStr>,
    pub cseq: Option<CSeq>,
    pub max_forwards: Option<u32>,
    pub contact: Option<NameAddr>,

    /// P-Asserted-Identity values, passed through verbatim
    pub pai: Vec<BytesStr>,

    /// Diversion values (RFC 5806), passed through verbatim
    pub diversion: Vec<BytesStr>,
}

impl SipMessage {
    pub fn new_request(method: Method, uri: SipUri) -> Self {
        Self::new(MessageLine::Request(RequestLine { method, uri }))
    }

    pub fn new_response(code: StatusCode, reason: Option<&str>) -> Self {
        let reason = match reason {
            Some(reason) => BytesStr::from(reason),
            None => BytesStr::from_static(code.reason_phrase()),
        };

        Self::new(MessageLine::Response(StatusLine {
            code,
            reason: Some(reason),
        }))
    }

    fn new(line: MessageLine) -> Self {
        Self {
            line,
            headers: Headers::new(),
            body: MessageBody::new(),
            call_id: None,
            from: None,
            to: None,
            via_branch: None,
            cseq: None,
            max_forwards: None,
            contact: None,
            pai: Vec::new(),
            diversion: Vec::new(),
        }
    }

    /// Parse exactly one message from `src`, returning it together with
    /// the unconsumed remainder (UDP peers may concatenate PDUs).
    pub fn parse_one(src: &Bytes) -> Result<(SipMessage, Bytes), ParseSipMessageError> {
        let mut parser = PullParser::new(src, 0);

        let first_line = match parser.next() {
            Some(Ok(line)) => line,
            _ => return Err(ParseSipMessageError::Incomplete),
        };

        let first_line =
            std::str::from_utf8(first_line).map_err(|_| ParseSipMessageError::InvalidUtf8)?;

        let (_, line) = MessageLine::parse(src, first_line)
            .finish()
            .map_err(|_| ParseSipMessageError::InvalidStartLine)?;

        let mut headers = Headers::with_capacity(16);

        for header_line in &mut parser {
            let header_line = header_line.map_err(|_| ParseSipMessageError::Incomplete)?;
            let header_line =
                std::str::from_utf8(header_line).map_err(|_| ParseSipMessageError::InvalidUtf8)?;

            let (_, parsed) = Line::parse(src, header_line)
                .finish()
                .map_err(|_| ParseSipMessageError::InvalidHeaderLine)?;

            headers.insert(parsed.name, parsed.value);
        }

        let head_end = parser.head_end();

        let content_length = headers
            .get(&Name::CONTENT_LENGTH)
            .and_then(|value| value.as_str().trim().parse::<usize>().ok());

        let body_len = content_length.unwrap_or(src.len() - head_end);

        if head_end + body_len > src.len() {
            return Err(ParseSipMessageError::BodyIncomplete);
        }

        let body_bytes = src.slice(head_end..head_end + body_len);
        let remainder = src.slice(head_end + body_len..);

        let body = MessageBody::parse(headers.get(&Name::CONTENT_TYPE), body_bytes);

        let mut msg = SipMessage {
            line,
            headers,
            body,
            call_id: None,
            from: None,
            to: None,
            via_branch: None,
            cseq: None,
            max_forwards: None,
            contact: None,
            pai: Vec::new(),
            diversion: Vec::new(),
        };
        msg.extract_base_headers();

        Ok((msg, remainder))
    }

    fn extract_base_headers(&mut self) {
        self.call_id = self.headers.get(&Name::CALL_ID).cloned();
        self.from = self.headers.get(&Name::FROM).and_then(NameAddr::from_value);
        self.to = self.headers.get(&Name::TO).and_then(NameAddr::from_value);
        self.via_branch = self
            .headers
            .get(&Name::VIA)
            .and_then(Via::from_value)
            .and_then(|via| via.branch().cloned());
        self.cseq = self.headers.get(&Name::CSEQ).and_then(CSeq::from_value);
        self.max_forwards = self
            .headers
            .get(&Name::MAX_FORWARDS)
            .and_then(|v| v.as_str().trim().parse().ok());
        self.contact = self
            .headers
            .get(&Name::CONTACT)
            .and_then(NameAddr::from_value);
        self.pai = self.headers.get_all(&Name::P_ASSERTED_IDENTITY).cloned().collect();
        self.diversion = self.headers.get_all(&Name::DIVERSION).cloned().collect();
    }

    pub fn is_request(&self) -> bool {
        self.line.is_request()
    }

    pub fn method(&self) -> Option<&Method> {
        self.line.request_method()
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        self.line.status_code()
    }

    pub fn from_tag(&self) -> Option<&BytesStr> {
        self.from.as_ref().and_then(NameAddr::tag)
    }

    pub fn to_tag(&self) -> Option<&BytesStr> {
        self.to.as_ref().and_then(NameAddr::tag)
    }

    /// User part of the request URI, which selects the prompt repository
    pub fn request_user(&self) -> Option<&BytesStr> {
        match &self.line {
            MessageLine::Request(line) => line.uri.user.as_ref(),
            MessageLine::Response(_) => None,
        }
    }

    /// Serialize into wire bytes: canonical header order, assembled body
    /// and computed Content-Length
    pub fn serialize(&self) -> Bytes {
        let (content_type, body) = self.body.assemble();

        let mut out = Vec::with_capacity(512 + body.len());

        // start line
        out.extend_from_slice(self.line.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");

        let order = canonical_order(&self.line);

        let mut write_header = |name: &Name, value: &BytesStr, out: &mut Vec<u8>| {
            out.extend_from_slice(name.as_print_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        };

        // the mandatory set in canonical order
        for name in order {
            for value in self.headers.get_all(name) {
                write_header(name, value, &mut out);
            }
        }

        // remaining headers in insertion order, P- and Content- deferred
        for (name, value) in self.headers.iter() {
            if order.iter().any(|o| o == name) || name.is_p_header() || name.is_content_header() {
                continue;
            }
            write_header(name, value, &mut out);
        }

        for (name, value) in self.headers.iter() {
            if name.is_p_header() {
                write_header(name, value, &mut out);
            }
        }

        // Content-* trail the header block; type and length always follow
        // the assembled body
        for (name, value) in self.headers.iter() {
            if name.is_content_header()
                && name != &Name::CONTENT_TYPE
                && name != &Name::CONTENT_LENGTH
            {
                write_header(name, value, &mut out);
            }
        }

        if let Some(content_type) = &content_type {
            out.extend_from_slice(b"Content-Type: ");
            out.extend_from_slice(content_type.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n\r\n");

        out.extend_from_slice(&body);

        Bytes::from(out)
    }
}

/// Canonical header emission order. Requests lead with routing headers
/// and Max-Forwards, responses never carry Route/Max-Forwards.
fn canonical_order(line: &MessageLine) -> &'static [Name] {
    static REQUEST: &[Name] = &[
        Name::VIA,
        Name::ROUTE,
        Name::RECORD_ROUTE,
        Name::FROM,
        Name::TO,
        Name::CALL_ID,
        Name::CSEQ,
        Name::MAX_FORWARDS,
        Name::CONTACT,
        Name::RACK,
        Name::SUPPORTED,
        Name::REQUIRE,
        Name::ALLOW,
        Name::EVENT,
        Name::EXPIRES,
        Name::SESSION_EXPIRES,
        Name::MIN_SE,
        Name::DIVERSION,
        Name::REASON,
        Name::WARNING,
        Name::USER_AGENT,
    ];

    static ACK_CANCEL: &[Name] = &[
        Name::VIA,
        Name::ROUTE,
        Name::FROM,
        Name::TO,
        Name::CALL_ID,
        Name::CSEQ,
        Name::MAX_FORWARDS,
        Name::REASON,
    ];

    static RESPONSE: &[Name] = &[
        Name::VIA,
        Name::RECORD_ROUTE,
        Name::FROM,
        Name::TO,
        Name::CALL_ID,
        Name::CSEQ,
        Name::CONTACT,
        Name::RSEQ,
        Name::SUPPORTED,
        Name::REQUIRE,
        Name::ALLOW,
        Name::SESSION_EXPIRES,
        Name::MIN_SE,
        Name::DIVERSION,
        Name::REASON,
        Name::WARNING,
        Name::SERVER,
    ];

    match line {
        MessageLine::Request(line)
            if line.method == Method::ACK || line.method == Method::CANCEL =>
        {
            ACK_CANCEL
        }
        MessageLine::Request(_) => REQUEST,
        MessageLine::Response(_) => RESPONSE,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::body::BodyType;

    const INVITE: &[u8] = b"INVITE sip:3001@192.0.2.20:5060 SIP/2.0\r\n\
        Via: SIP/2.0/UDP 192.0.2.10:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        From: \"Alice\" <sip:alice@192.0.2.10>;tag=9fxced76sl\r\n\
        To: <sip:3001@192.0.2.20>\r\n\
        Call-ID: 3848276298220188511@192.0.2.10\r\n\
        CSeq: 1 INVITE\r\n\
        Contact: <sip:alice@192.0.2.10:5060>\r\n\
        P-Asserted-Identity: <sip:+3300001@192.0.2.10>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 13\r\n\
        \r\n\
        v=0\r\no=test\r\n";

    #[test]
    fn parse_request() {
        let (msg, remainder) = SipMessage::parse_one(&Bytes::from_static(INVITE)).unwrap();

        assert!(remainder.is_empty());
        assert!(msg.is_request());
        assert_eq!(msg.method(), Some(&Method::INVITE));
        assert_eq!(msg.request_user().unwrap(), "3001");
        assert_eq!(msg.call_id.as_ref().unwrap(), "3848276298220188511@192.0.2.10");
        assert_eq!(msg.from_tag().unwrap(), "9fxced76sl");
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.via_branch.as_ref().unwrap(), "z9hG4bKnashds7");
        assert_eq!(msg.cseq.as_ref().unwrap(), &CSeq::new(1, Method::INVITE));
        assert_eq!(msg.max_forwards, Some(70));
        assert_eq!(msg.pai.len(), 1);
        assert!(msg.body.contains(BodyType::Sdp));
        assert_eq!(msg.body.get(BodyType::Sdp).unwrap().data.as_ref(), b"v=0\r\no=test\r\n");
    }

    #[test]
    fn parse_concatenated_pdus() {
        let mut two = INVITE.to_vec();
        two.extend_from_slice(
            b"OPTIONS sip:keep@192.0.2.20 SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.0.2.10;branch=z9hG4bKopt1\r\n\
            Call-ID: opts-1\r\n\
            CSeq: 20 OPTIONS\r\n\
            Content-Length: 0\r\n\
            \r\n",
        );

        let src = Bytes::from(two);

        let (first, remainder) = SipMessage::parse_one(&src).unwrap();
        assert_eq!(first.method(), Some(&Method::INVITE));
        assert!(!remainder.is_empty());

        let (second, rest) = SipMessage::parse_one(&remainder).unwrap();
        assert_eq!(second.method(), Some(&Method::OPTIONS));
        assert_eq!(second.cseq.as_ref().unwrap().cseq, 20);
        assert!(rest.is_empty());
    }

    #[test]
    fn parse_response() {
        let raw = b"SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP 192.0.2.10;branch=z9hG4bK74bf9\r\n\
            From: <sip:a@x>;tag=1\r\n\
            To: <sip:b@y>;tag=2\r\n\
            Call-ID: cid-1\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\
            \r\n";

        let (msg, _) = SipMessage::parse_one(&Bytes::from_static(raw)).unwrap();

        assert!(!msg.is_request());
        assert_eq!(msg.status_code(), Some(StatusCode::RINGING));
        assert_eq!(msg.to_tag().unwrap(), "2");
    }

    #[test]
    fn compact_header_forms() {
        let raw = b"BYE sip:b@y SIP/2.0\r\n\
            v: SIP/2.0/UDP 192.0.2.10;branch=z9hG4bKx\r\n\
            f: <sip:a@x>;tag=1\r\n\
            t: <sip:b@y>;tag=2\r\n\
            i: compact-cid\r\n\
            CSeq: 2 BYE\r\n\
            l: 0\r\n\
            \r\n";

        let (msg, _) = SipMessage::parse_one(&Bytes::from_static(raw)).unwrap();

        assert_eq!(msg.call_id.as_ref().unwrap(), "compact-cid");
        assert_eq!(msg.via_branch.as_ref().unwrap(), "z9hG4bKx");
    }

    #[test]
    fn serialize_orders_headers() {
        let mut msg = SipMessage::new_response(StatusCode::OK, None);
        msg.headers.insert(Name::CALL_ID, "cid");
        msg.headers.insert(Name::P_ASSERTED_IDENTITY, "<sip:x@y>");
        msg.headers.insert(Name::FROM, "<sip:a@x>;tag=1");
        msg.headers.insert(Name::VIA, "SIP/2.0/UDP h;branch=z9hG4bKx");
        msg.headers.insert(Name::CSEQ, "1 INVITE");
        msg.headers.insert(Name::TO, "<sip:b@y>;tag=2");

        let bytes = msg.serialize();
        let text = std::str::from_utf8(&bytes).unwrap();

        let via = text.find("Via:").unwrap();
        let from = text.find("From:").unwrap();
        let to = text.find("To:").unwrap();
        let call_id = text.find("Call-ID:").unwrap();
        let pai = text.find("P-Asserted-Identity:").unwrap();
        let content_length = text.find("Content-Length:").unwrap();

        assert!(via < from && from < to && to < call_id);
        assert!(call_id < pai, "P-header must trail the mandatory set");
        assert!(pai < content_length);
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn serialize_parse_round_trip() {
        let mut msg = SipMessage::new_request(
            Method::INVITE,
            SipUri::new(Some("3001".into()), "192.0.2.20", Some(5060)),
        );
        msg.headers.insert(Name::VIA, "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKabc");
        msg.headers.insert(Name::FROM, "<sip:mrf@192.0.2.1>;tag=ff1");
        msg.headers.insert(Name::TO, "<sip:3001@192.0.2.20>");
        msg.headers.insert(Name::CALL_ID, "round-trip-1");
        msg.headers.insert(Name::CSEQ, "1 INVITE");
        msg.headers.insert(Name::MAX_FORWARDS, "70");
        msg.body = MessageBody::single(BodyType::Sdp, &b"v=0\r\n"[..]);

        let bytes = msg.serialize();
        let (reparsed, rest) = SipMessage::parse_one(&bytes).unwrap();

        assert!(rest.is_empty());
        assert_eq!(reparsed.method(), Some(&Method::INVITE));
        assert_eq!(reparsed.call_id.as_ref().unwrap(), "round-trip-1");
        assert_eq!(reparsed.cseq.as_ref().unwrap(), &CSeq::new(1, Method::INVITE));
        assert_eq!(reparsed.body.get(BodyType::Sdp).unwrap().data.as_ref(), b"v=0\r\n");

        // serializing the reparsed message yields the same bytes
        assert_eq!(reparsed.serialize(), bytes);
    }

    #[test]
    fn folded_header_line() {
        let raw = b"OPTIONS sip:user@example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.0.2.1;branch=z9hG4bKkdjuw\r\n\
            Call-ID: folded-1\r\n\
            CSeq: 8 OPTIONS\r\n\
            Accept: application/sdp,\r\n\
            \tmultipart/mixed\r\n\
            Content-Length: 0\r\n\
            \r\n";

        let (msg, _) = SipMessage::parse_one(&Bytes::from_static(raw)).unwrap();
        let accept = msg.headers.get(&Name::ACCEPT).unwrap();

        assert!(accept.as_str().contains("application/sdp"));
        assert!(accept.as_str().contains("multipart/mixed"));
    }
}
