use bytesstr::BytesStr;

/// Represents a SIP-Header's name. It is used as key inside
/// [Headers](crate::Headers).
#[derive(Debug, Clone)]
pub struct Name(Repr);

impl Name {
    /// Returns a Name carrying a name not implemented as a constant
    pub const fn unknown(name: BytesStr) -> Self {
        Self(Repr::Unknown(name))
    }

    /// P-prefixed extension headers get appended after the mandatory set
    /// when serializing
    pub fn is_p_header(&self) -> bool {
        let name = self.as_print_str();
        name.len() > 2 && (name.starts_with("P-") || name.starts_with("p-"))
    }

    /// Content-* headers trail the header block, right before the body
    pub fn is_content_header(&self) -> bool {
        self.as_print_str()
            .get(..8)
            .is_some_and(|p| p.eq_ignore_ascii_case("Content-"))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        let other_print_str = other.as_print_str();

        if self == other_print_str {
            return true;
        }

        other
            .as_parse_strs()
            .map(|strs| strs.iter().any(|&str| self.eq(str)))
            .unwrap_or_default()
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        if self.as_print_str().eq_ignore_ascii_case(other) {
            return true;
        }

        self.as_parse_strs()
            .map(|strs| strs.iter().any(|str| str.eq_ignore_ascii_case(other)))
            .unwrap_or_default()
    }
}

impl<T> From<T> for Name
where
    T: Into<BytesStr> + AsRef<[u8]>,
{
    fn from(name: T) -> Self {
        Name::from_bytes(name)
    }
}

macro_rules! header_names {
    ($($print:literal, $ident:ident, [$($parse:literal),+], $konst:ident;)+) => {
        #[derive(Debug, Clone)]
        enum Repr {
            $($ident,)+
            Unknown(BytesStr),
        }

        static NAMES: &[(&str, Name)] = &[
            $($( ($parse, Name::$konst), )*)*
        ];

        impl Name {
            $(
            pub const $konst: Name = Name(Repr::$ident);
            )+

            fn from_bytes(name: impl Into<BytesStr> + AsRef<[u8]>) -> Name {
                let slice: &[u8] = name.as_ref();

                for (parse, name) in NAMES {
                    if parse.as_bytes().eq_ignore_ascii_case(slice) {
                        return name.clone();
                    }
                }

                Name::unknown(name.into())
            }

            pub fn as_print_str(&self) -> &str {
                match &self.0 {
                    $(Repr::$ident => $print,)*
                    Repr::Unknown(name) => name.as_ref(),
                }
            }

            pub const fn as_parse_strs(&self) -> Option<&[&str]> {
                match &self.0 {
                    $(
                    Repr::$ident => Some(&[$($parse),*]),
                    )+
                    Repr::Unknown(_) => None,
                }
            }
        }
    };
}

header_names! {
    "Accept",               Accept,             ["accept"],                 ACCEPT;
    "Allow",                Allow,              ["allow"],                  ALLOW;
    "Call-ID",              CallID,             ["call-id", "i"],           CALL_ID;
    "Contact",              Contact,            ["contact", "m"],           CONTACT;
    "Content-Disposition",  ContentDisposition, ["content-disposition"],    CONTENT_DISPOSITION;
    "Content-Length",       ContentLength,      ["content-length", "l"],    CONTENT_LENGTH;
    "Content-Type",         ContentType,        ["content-type", "c"],      CONTENT_TYPE;
    "CSeq",                 CSeq,               ["cseq"],                   CSEQ;
    "Diversion",            Diversion,          ["diversion"],              DIVERSION;
    "Event",                Event,              ["event", "o"],             EVENT;
    "Expires",              Expires,            ["expires"],                EXPIRES;
    "From",                 From,               ["from", "f"],              FROM;
    "Max-Forwards",         MaxForwards,        ["max-forwards"],           MAX_FORWARDS;
    "Min-SE",               MinSe,              ["min-se"],                 MIN_SE;
    "P-Asserted-Identity",  PAssertedIdentity,  ["p-asserted-identity"],    P_ASSERTED_IDENTITY;
    "RAck",                 RAck,               ["rack"],                   RACK;
    "Reason",               Reason,             ["reason"],                 REASON;
    "Record-Route",         RecordRoute,        ["record-route"],           RECORD_ROUTE;
    "Require",              Require,            ["require"],                REQUIRE;
    "Route",                Route,              ["route"],                  ROUTE;
    "RSeq",                 RSeq,               ["rseq"],                   RSEQ;
    "Server",               Server,             ["server"],                 SERVER;
    "Session-Expires",      SessionExpires,     ["session-expires", "x"],   SESSION_EXPIRES;
    "Supported",            Supported,          ["supported", "k"],         SUPPORTED;
    "To",                   To,                 ["to", "t"],                TO;
    "User-Agent",           UserAgent,          ["user-agent"],             USER_AGENT;
    "Via",                  Via,                ["via", "v"],               VIA;
    "Warning",              Warning,            ["warning"],                WARNING;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_names_compare_case_insensitively() {
        assert_eq!(Name::VIA, Name::unknown(BytesStr::from_static("Via")));
        assert_eq!(Name::VIA, Name::unknown(BytesStr::from_static("v")));
        assert_eq!(Name::from("CALL-ID"), Name::CALL_ID);
        assert_eq!(Name::from("i"), Name::CALL_ID);
    }

    #[test]
    fn p_header_discovery() {
        assert!(Name::P_ASSERTED_IDENTITY.is_p_header());
        assert!(Name::from("P-Charging-Vector").is_p_header());
        assert!(!Name::VIA.is_p_header());
    }

    #[test]
    fn content_header_discovery() {
        assert!(Name::CONTENT_TYPE.is_content_header());
        assert!(Name::CONTENT_LENGTH.is_content_header());
        assert!(!Name::CONTACT.is_content_header());
    }
}
