//! The XML control protocol carried in SIP INFO bodies
//! (`application/msc-ivr+xml`): `play`/`playcollect` requests driving
//! prompt playback, and the response reporting duration and collected
//! digits.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

#[derive(Debug, thiserror::Error)]
pub enum MscParseError {
    #[error("invalid xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("invalid attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("no play or playcollect request found")]
    NoRequest,
}

/// Which request element initiated a playback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Play,
    PlayCollect,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Play => "play",
            RequestKind::PlayCollect => "playcollect",
        }
    }
}

/// A parsed `<play>` / `<playcollect>` request
#[derive(Debug, Clone)]
pub struct MscRequest {
    pub kind: RequestKind,

    /// Prompt audio ids in playback order
    pub audios: Vec<String>,

    /// `repeat="infinite"` on the prompt element
    pub repeat_infinite: bool,

    /// `barge="yes"` allows DTMF to interrupt the playback
    pub barge: bool,
}

impl MscRequest {
    pub fn parse(xml: &[u8]) -> Result<Self, MscParseError> {
        let text = String::from_utf8_lossy(xml);
        let mut reader = Reader::from_str(&text);

        let mut kind = None;
        let mut audios = Vec::new();
        let mut repeat_infinite = false;
        let mut barge = false;

        loop {
            match reader.read_event()? {
                Event::Start(element) | Event::Empty(element) => {
                    match element.name().as_ref() {
                        b"play" => kind = Some(RequestKind::Play),
                        b"playcollect" => {
                            kind = Some(RequestKind::PlayCollect);
                            barge = attribute(&element, b"barge")?
                                .map(|v| v.eq_ignore_ascii_case("yes"))
                                .unwrap_or(false);
                        }
                        b"prompt" => {
                            repeat_infinite = attribute(&element, b"repeat")?
                                .map(|v| v.eq_ignore_ascii_case("infinite"))
                                .unwrap_or(false);
                        }
                        b"audio" => {
                            if let Some(url) = attribute(&element, b"url")? {
                                audios.push(url);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let kind = kind.ok_or(MscParseError::NoRequest)?;

        Ok(Self {
            kind,
            audios,
            repeat_infinite,
            barge,
        })
    }
}

fn attribute(
    element: &BytesStart<'_>,
    name: &[u8],
) -> Result<Option<String>, MscParseError> {
    for attr in element.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == name {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }

    Ok(None)
}

/// Why a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayReason {
    /// Ran to completion (or the infinite repeat was torn down)
    Timeout,
    /// Stopped by an external event such as barge-in
    Interrupted,
}

impl PlayReason {
    pub fn as_str(self) -> &'static str {
        match self {
            PlayReason::Timeout => "timeout",
            PlayReason::Interrupted => "interrupted",
        }
    }
}

/// Render the `<response .../>` document reporting a finished playback
pub fn build_response(
    kind: RequestKind,
    reason: PlayReason,
    playduration_ms: u64,
    playoffset_ms: u64,
    digits: Option<char>,
) -> String {
    let digits = match digits {
        Some(digit) => format!(" digits=\"{digit}\""),
        None => String::new(),
    };

    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <MediaServerControl version=\"1.0\">\
        <response playduration=\"{playduration_ms}\" reason=\"{reason}\" \
        playoffset=\"{playoffset_ms}\" text=\"The request has succeeded\" \
        request=\"{kind}\" code=\"200\"{digits}/>\
        </MediaServerControl>",
        reason = reason.as_str(),
        kind = kind.as_str(),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_play() {
        let xml = br#"<?xml version="1.0"?>
            <MediaServerControl version="1.0">
              <request>
                <play>
                  <prompt><audio url="greeting"/><audio url="menu"/></prompt>
                </play>
              </request>
            </MediaServerControl>"#;

        let request = MscRequest::parse(xml).unwrap();

        assert_eq!(request.kind, RequestKind::Play);
        assert_eq!(request.audios, ["greeting", "menu"]);
        assert!(!request.repeat_infinite);
        assert!(!request.barge);
    }

    #[test]
    fn parse_playcollect_with_barge_and_repeat() {
        let xml = br#"<MediaServerControl version="1.0">
            <request>
              <playcollect barge="yes">
                <prompt repeat="infinite"><audio url="hold-music"/></prompt>
              </playcollect>
            </request>
          </MediaServerControl>"#;

        let request = MscRequest::parse(xml).unwrap();

        assert_eq!(request.kind, RequestKind::PlayCollect);
        assert_eq!(request.audios, ["hold-music"]);
        assert!(request.repeat_infinite);
        assert!(request.barge);
    }

    #[test]
    fn parse_rejects_foreign_xml() {
        assert!(matches!(
            MscRequest::parse(b"<MediaServerControl><request/></MediaServerControl>"),
            Err(MscParseError::NoRequest)
        ));
    }

    #[test]
    fn response_document() {
        let xml = build_response(
            RequestKind::PlayCollect,
            PlayReason::Interrupted,
            1540,
            1540,
            Some('5'),
        );

        assert!(xml.contains("playduration=\"1540\""));
        assert!(xml.contains("reason=\"interrupted\""));
        assert!(xml.contains("request=\"playcollect\""));
        assert!(xml.contains("code=\"200\""));
        assert!(xml.contains("digits=\"5\""));

        let without_digits =
            build_response(RequestKind::Play, PlayReason::Timeout, 2000, 2000, None);
        assert!(!without_digits.contains("digits"));
        assert!(without_digits.contains("reason=\"timeout\""));
    }
}
