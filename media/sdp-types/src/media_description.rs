use crate::{Connection, Direction, Fmtp, Media, RtpMap, UnknownAttribute};
use std::fmt;

/// Part of the [`SessionDescription`](crate::SessionDescription) which
/// describes a single media stream
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-5.14)
#[derive(Debug, Clone)]
pub struct MediaDescription {
    /// Media description's media field (m=)
    pub media: Media,

    /// Optional connection (c field)
    pub connection: Option<Connection>,

    /// Media direction attribute, when explicitly present
    pub direction: Option<Direction>,

    /// Packetization time attribute (a=ptime), in milliseconds
    pub ptime: Option<u32>,

    /// RTP payload mappings
    pub rtpmap: Vec<RtpMap>,

    /// RTP encoding parameters
    pub fmtp: Vec<Fmtp>,

    /// Additional attributes
    pub attributes: Vec<UnknownAttribute>,
}

impl MediaDescription {
    pub fn new(media: Media) -> Self {
        Self {
            media,
            connection: None,
            direction: None,
            ptime: None,
            rtpmap: Vec::new(),
            fmtp: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// A rejected copy of this stream: same media line with port zero and
    /// no attributes
    pub fn rejected(&self) -> Self {
        let mut media = self.media.clone();
        media.port = 0;
        media.ports_num = None;
        Self::new(media)
    }

    /// Find the rtpmap entry for a payload number
    pub fn rtpmap_for(&self, payload: u8) -> Option<&RtpMap> {
        self.rtpmap.iter().find(|map| map.payload == payload)
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={}\r\n", self.media)?;

        if let Some(conn) = &self.connection {
            write!(f, "{conn}\r\n")?;
        }

        for rtpmap in &self.rtpmap {
            write!(f, "a=rtpmap:{rtpmap}\r\n")?;
        }

        for fmtp in &self.fmtp {
            write!(f, "a=fmtp:{fmtp}\r\n")?;
        }

        if let Some(ptime) = self.ptime {
            write!(f, "a=ptime:{ptime}\r\n")?;
        }

        if let Some(direction) = self.direction {
            write!(f, "a={direction}\r\n")?;
        }

        for attr in &self.attributes {
            write!(f, "{attr}\r\n")?;
        }

        Ok(())
    }
}
