//! Message bodies: single-part and multipart/mixed handling

use bytes::Bytes;
use bytesstr::BytesStr;

/// Fixed boundary token used when emitting multipart/mixed bodies
pub const MULTIPART_BOUNDARY: &str = "unique-boundary-0bc4a397524c";

/// Classification of a body part by its Content-Type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyType {
    Sdp,
    Json,
    MscIvrXml,
    Pidf,
    VndOrangeInData,
    DtmfRelay,
    Unknown,
}

impl BodyType {
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim();

        if essence.eq_ignore_ascii_case("application/sdp") {
            BodyType::Sdp
        } else if essence.eq_ignore_ascii_case("application/json") {
            BodyType::Json
        } else if essence.eq_ignore_ascii_case("application/msc-ivr+xml") {
            BodyType::MscIvrXml
        } else if essence.eq_ignore_ascii_case("image/pidf+xml") {
            BodyType::Pidf
        } else if essence.eq_ignore_ascii_case("application/vnd.orange-in-data") {
            BodyType::VndOrangeInData
        } else if essence.eq_ignore_ascii_case("application/dtmf-relay") {
            BodyType::DtmfRelay
        } else {
            BodyType::Unknown
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            BodyType::Sdp => "application/sdp",
            BodyType::Json => "application/json",
            BodyType::MscIvrXml => "application/msc-ivr+xml",
            BodyType::Pidf => "image/pidf+xml",
            BodyType::VndOrangeInData => "application/vnd.orange-in-data",
            BodyType::DtmfRelay => "application/dtmf-relay",
            BodyType::Unknown => "application/octet-stream",
        }
    }
}

/// One part of a message body
#[derive(Debug, Clone)]
pub struct ContentPart {
    /// The Content-Type value as received or to be emitted
    pub content_type: BytesStr,
    pub data: Bytes,
}

impl ContentPart {
    pub fn new(body_type: BodyType, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: BytesStr::from_static(body_type.content_type()),
            data: data.into(),
        }
    }
}

/// Parsed or to-be-sent message body, keyed by [BodyType]
#[derive(Debug, Clone, Default)]
pub struct MessageBody {
    parts: Vec<(BodyType, ContentPart)>,
}

impl MessageBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(body_type: BodyType, data: impl Into<Bytes>) -> Self {
        let mut body = Self::new();
        body.insert(body_type, ContentPart::new(body_type, data));
        body
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn contains(&self, body_type: BodyType) -> bool {
        self.parts.iter().any(|(bt, _)| *bt == body_type)
    }

    pub fn get(&self, body_type: BodyType) -> Option<&ContentPart> {
        self.parts
            .iter()
            .find(|(bt, _)| *bt == body_type)
            .map(|(_, part)| part)
    }

    /// Insert a part, replacing any previous part of the same type
    pub fn insert(&mut self, body_type: BodyType, part: ContentPart) {
        self.parts.retain(|(bt, _)| *bt != body_type);
        self.parts.push((body_type, part));
    }

    pub fn parts(&self) -> impl Iterator<Item = (BodyType, &ContentPart)> + '_ {
        self.parts.iter().map(|(bt, part)| (*bt, part))
    }

    /// Parse body bytes according to the message's Content-Type
    pub fn parse(content_type: Option<&BytesStr>, data: Bytes) -> Self {
        let mut body = MessageBody::new();

        if data.is_empty() {
            return body;
        }

        let Some(content_type) = content_type else {
            body.insert(
                BodyType::Unknown,
                ContentPart {
                    content_type: BytesStr::from_static("application/octet-stream"),
                    data,
                },
            );
            return body;
        };

        let essence = content_type.split(';').next().unwrap_or("").trim();

        if essence.eq_ignore_ascii_case("multipart/mixed") {
            if let Some(boundary) = boundary_param(content_type) {
                parse_multipart(&mut body, &data, boundary);
                return body;
            }
        }

        let body_type = BodyType::from_content_type(content_type);
        body.insert(
            body_type,
            ContentPart {
                content_type: content_type.clone(),
                data,
            },
        );

        body
    }

    /// Assemble the wire bytes and the matching Content-Type value.
    ///
    /// Two or more parts become a multipart/mixed body with the fixed
    /// boundary token and per-part Content-* headers.
    pub fn assemble(&self) -> (Option<String>, Vec<u8>) {
        match self.parts.len() {
            0 => (None, Vec::new()),
            1 => {
                let (_, part) = &self.parts[0];
                (
                    Some(part.content_type.to_string()),
                    part.data.to_vec(),
                )
            }
            _ => {
                let mut out = Vec::new();

                for (_, part) in &self.parts {
                    out.extend_from_slice(b"--");
                    out.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(b"Content-Type: ");
                    out.extend_from_slice(part.content_type.as_bytes());
                    out.extend_from_slice(b"\r\nContent-Length: ");
                    out.extend_from_slice(part.data.len().to_string().as_bytes());
                    out.extend_from_slice(b"\r\n\r\n");
                    out.extend_from_slice(&part.data);
                    out.extend_from_slice(b"\r\n");
                }

                out.extend_from_slice(b"--");
                out.extend_from_slice(MULTIPART_BOUNDARY.as_bytes());
                out.extend_from_slice(b"--\r\n");

                (
                    Some(format!("multipart/mixed;boundary={MULTIPART_BOUNDARY}")),
                    out,
                )
            }
        }
    }
}

fn boundary_param(content_type: &str) -> Option<&str> {
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param
            .strip_prefix("boundary=")
            .or_else(|| param.strip_prefix("Boundary="))
        {
            return Some(value.trim_matches('"'));
        }
    }

    None
}

fn parse_multipart(body: &mut MessageBody, data: &Bytes, boundary: &str) {
    let delimiter = format!("--{boundary}");
    let bytes: &[u8] = data;

    let mut sections = Vec::new();
    let mut search = 0;

    while let Some(pos) = find(bytes, delimiter.as_bytes(), search) {
        sections.push(pos);
        search = pos + delimiter.len();
    }

    for window in sections.windows(2) {
        let start = window[0] + delimiter.len();
        let end = window[1];
        if start >= end {
            continue;
        }

        let section = &bytes[start..end];

        // a terminating "--" directly after the delimiter ends the body
        if section.starts_with(b"--") {
            break;
        }

        // skip the line break after the delimiter, then split part
        // headers from part content on the first empty line
        let section_start = match section.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => continue,
        };
        let section = &section[section_start..];

        let (part_headers, content) = match find(section, b"\r\n\r\n", 0) {
            Some(pos) => (&section[..pos], &section[pos + 4..]),
            None => match find(section, b"\n\n", 0) {
                Some(pos) => (&section[..pos], &section[pos + 2..]),
                None => (&[][..], section),
            },
        };

        // the part content ends before the line break preceding the next
        // delimiter
        let content = strip_trailing_newline(content);

        let content_type = part_content_type(part_headers);
        let body_type = content_type
            .as_deref()
            .map(BodyType::from_content_type)
            .unwrap_or(BodyType::Unknown);

        let start_off = content.as_ptr() as usize - bytes.as_ptr() as usize;
        let part_data = data.slice(start_off..start_off + content.len());

        body.insert(
            body_type,
            ContentPart {
                content_type: content_type
                    .map(BytesStr::from)
                    .unwrap_or_else(|| BytesStr::from_static("application/octet-stream")),
                data: part_data,
            },
        );
    }
}

fn part_content_type(headers: &[u8]) -> Option<String> {
    for line in headers.split(|&b| b == b'\n') {
        let line = std::str::from_utf8(line).ok()?.trim();
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-type") {
                return Some(value.trim().to_string());
            }
        }
    }

    None
}

fn strip_trailing_newline(content: &[u8]) -> &[u8] {
    match content {
        [rest @ .., b'\r', b'\n'] => rest,
        [rest @ .., b'\n'] => rest,
        _ => content,
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }

    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn body_type_classification() {
        assert_eq!(BodyType::from_content_type("application/sdp"), BodyType::Sdp);
        assert_eq!(
            BodyType::from_content_type("Application/SDP;charset=utf-8"),
            BodyType::Sdp
        );
        assert_eq!(
            BodyType::from_content_type("application/msc-ivr+xml"),
            BodyType::MscIvrXml
        );
        assert_eq!(
            BodyType::from_content_type("application/dtmf-relay"),
            BodyType::DtmfRelay
        );
        assert_eq!(BodyType::from_content_type("text/plain"), BodyType::Unknown);
    }

    #[test]
    fn single_part() {
        let ct = BytesStr::from_static("application/sdp");
        let body = MessageBody::parse(Some(&ct), Bytes::from_static(b"v=0\r\n"));

        assert!(body.contains(BodyType::Sdp));
        assert_eq!(body.get(BodyType::Sdp).unwrap().data.as_ref(), b"v=0\r\n");

        let (content_type, bytes) = body.assemble();
        assert_eq!(content_type.as_deref(), Some("application/sdp"));
        assert_eq!(bytes, b"v=0\r\n");
    }

    #[test]
    fn multipart_round_trip() {
        let mut body = MessageBody::new();
        body.insert(BodyType::Sdp, ContentPart::new(BodyType::Sdp, &b"v=0\r\no=x\r\n"[..]));
        body.insert(
            BodyType::VndOrangeInData,
            ContentPart::new(BodyType::VndOrangeInData, &b"\x01\x02\x03"[..]),
        );

        let (content_type, bytes) = body.assemble();
        let content_type = BytesStr::from(content_type.unwrap());
        assert!(content_type.as_str().starts_with("multipart/mixed;boundary="));

        let parsed = MessageBody::parse(Some(&content_type), Bytes::from(bytes));

        assert_eq!(parsed.len(), 2);
        assert_eq!(
            parsed.get(BodyType::Sdp).unwrap().data.as_ref(),
            b"v=0\r\no=x\r\n"
        );
        assert_eq!(
            parsed.get(BodyType::VndOrangeInData).unwrap().data.as_ref(),
            b"\x01\x02\x03"
        );
    }

    #[test]
    fn foreign_multipart() {
        let raw = b"--sep\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n--sep--\r\n";
        let ct = BytesStr::from_static("multipart/mixed;boundary=sep");

        let parsed = MessageBody::parse(Some(&ct), Bytes::from_static(raw));

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed.get(BodyType::Sdp).unwrap().data.as_ref(), b"v=0");
    }

    #[test]
    fn empty_body() {
        let body = MessageBody::parse(None, Bytes::new());
        assert!(body.is_empty());

        let (content_type, bytes) = body.assemble();
        assert!(content_type.is_none());
        assert!(bytes.is_empty());
    }
}
