use crate::{
    Connection, Direction, Fmtp, Media, MediaDescription, Origin, RtpMap, UnknownAttribute,
};
use bytes::Bytes;
use bytesstr::BytesStr;
use internal::{Finish, verbose_error_to_owned};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum ParseSessionDescriptionError {
    #[error("sdp is missing the origin (o=) field")]
    MissingOrigin,
    #[error("sdp is missing the name (s=) field")]
    MissingName,
    #[error("invalid {line_kind} line, {error}")]
    InvalidLine {
        line_kind: char,
        error: nom::error::VerboseError<String>,
    },
}

/// A parsed SDP session description
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5)
#[derive(Debug, Clone)]
pub struct SessionDescription {
    /// Origin (o field)
    pub origin: Origin,

    /// Session name (s field)
    pub name: BytesStr,

    /// Optional session level connection (c field)
    pub connection: Option<Connection>,

    /// Session level media direction, when explicitly present
    pub direction: Option<Direction>,

    /// Session level packetization time (a=ptime)
    pub ptime: Option<u32>,

    /// Unparsed session level attributes
    pub attributes: Vec<UnknownAttribute>,

    /// Media streams, one per m= line
    pub media_descriptions: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(src: &BytesStr) -> Result<Self, ParseSessionDescriptionError> {
        let bytes: &Bytes = src.as_ref();

        let mut origin = None;
        let mut name = None;
        let mut connection = None;
        let mut direction = None;
        let mut ptime = None;
        let mut attributes = Vec::new();
        let mut media_descriptions: Vec<MediaDescription> = Vec::new();

        for raw_line in src.lines() {
            let line = raw_line.trim_end();
            if line.len() < 2 || line.as_bytes()[1] != b'=' {
                continue;
            }

            let kind = line.as_bytes()[0] as char;
            let value = &line[2..];

            // fields after the first m= line belong to that media stream
            let media = media_descriptions.last_mut();

            match kind {
                'o' => {
                    let (_, parsed) = Origin::parse(bytes, value)
                        .finish()
                        .map_err(|e| invalid_line('o', e))?;
                    origin = Some(parsed);
                }
                's' => {
                    name = Some(BytesStr::from_parse(bytes, value));
                }
                'c' => {
                    let (_, parsed) = Connection::parse(bytes, value)
                        .finish()
                        .map_err(|e| invalid_line('c', e))?;

                    match media {
                        Some(media) => media.connection = Some(parsed),
                        None => connection = Some(parsed),
                    }
                }
                'm' => {
                    let (_, parsed) = Media::parse(bytes, value)
                        .finish()
                        .map_err(|e| invalid_line('m', e))?;
                    media_descriptions.push(MediaDescription::new(parsed));
                }
                'a' => {
                    parse_attribute(bytes, value, media, &mut direction, &mut ptime, &mut attributes)?;
                }
                // v=, t=, b= and friends carry nothing this stack needs
                _ => {}
            }
        }

        Ok(SessionDescription {
            origin: origin.ok_or(ParseSessionDescriptionError::MissingOrigin)?,
            name: name.ok_or(ParseSessionDescriptionError::MissingName)?,
            connection,
            direction,
            ptime,
            attributes,
            media_descriptions,
        })
    }
}

fn invalid_line(
    line_kind: char,
    error: nom::error::VerboseError<&str>,
) -> ParseSessionDescriptionError {
    ParseSessionDescriptionError::InvalidLine {
        line_kind,
        error: verbose_error_to_owned(error),
    }
}

fn parse_attribute(
    bytes: &Bytes,
    value: &str,
    media: Option<&mut MediaDescription>,
    session_direction: &mut Option<Direction>,
    session_ptime: &mut Option<u32>,
    session_attributes: &mut Vec<UnknownAttribute>,
) -> Result<(), ParseSessionDescriptionError> {
    if let Some(direction) = Direction::from_attribute(value) {
        match media {
            Some(media) => media.direction = Some(direction),
            None => *session_direction = Some(direction),
        }
        return Ok(());
    }

    if let Some(ptime) = value.strip_prefix("ptime:") {
        let parsed = ptime.trim().parse().ok();
        match media {
            Some(media) => media.ptime = parsed,
            None => *session_ptime = parsed,
        }
        return Ok(());
    }

    if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
        if let Some(media) = media {
            let (_, parsed) = RtpMap::parse(bytes, rtpmap)
                .finish()
                .map_err(|e| invalid_line('a', e))?;
            media.rtpmap.push(parsed);
        }
        return Ok(());
    }

    if let Some(fmtp) = value.strip_prefix("fmtp:") {
        if let Some(media) = media {
            let (_, parsed) = Fmtp::parse(bytes, fmtp)
                .finish()
                .map_err(|e| invalid_line('a', e))?;
            media.fmtp.push(parsed);
        }
        return Ok(());
    }

    let attr = UnknownAttribute::parse(bytes, value);
    match media {
        Some(media) => media.attributes.push(attr),
        None => session_attributes.push(attr),
    }

    Ok(())
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n{}\r\ns={}\r\n", self.origin, self.name)?;

        if let Some(conn) = &self.connection {
            write!(f, "{conn}\r\n")?;
        }

        write!(f, "t=0 0\r\n")?;

        if let Some(ptime) = self.ptime {
            write!(f, "a=ptime:{ptime}\r\n")?;
        }

        if let Some(direction) = self.direction {
            write!(f, "a={direction}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        for media in &self.media_descriptions {
            write!(f, "{media}")?;
        }

        Ok(())
    }
}
