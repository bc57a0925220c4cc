use bytes::Bytes;
use bytesstr::BytesStr;
use internal::IResult;
use nom::branch::alt;
use nom::bytes::complete::{tag_no_case, take_while1};
use nom::combinator::map;
use std::fmt;

fn token(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '.' | '!' | '%' | '*' | '_' | '`' | '\'' | '~' | '+')
}

/// Represents a SIP-Method.
///
/// Well known methods are implemented as constants, everything else is
/// carried verbatim.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Method(Repr);

macro_rules! methods {
    ($($print:literal, $ident:ident;)+) => {
        #[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[allow(clippy::upper_case_acronyms)]
        enum Repr {
            $($ident,)+
            Other(BytesStr),
        }

        impl Method {
            $(pub const $ident: Self = Self(Repr::$ident);)+

            pub fn from_parse(src: &Bytes, slice: &str) -> Self {
                let result: IResult<'_, Repr> = alt((
                   $(
                   map(tag_no_case($print), |_| Repr::$ident),
                   )*
                ))(slice);

                if let Ok((_, repr)) = result {
                    Self(repr)
                } else {
                    Self(Repr::Other(BytesStr::from_parse(src, slice)))
                }
            }
        }

        impl fmt::Display for Method {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match &self.0 {
                   $(Repr::$ident => f.write_str($print),)+
                    Repr::Other(other) => f.write_str(other),
                }
            }
        }
    };
}

methods! {
    "INVITE",      INVITE;
    "ACK",         ACK;
    "CANCEL",      CANCEL;
    "BYE",         BYE;
    "REGISTER",    REGISTER;
    "UPDATE",      UPDATE;
    "PRACK",       PRACK;
    "OPTIONS",     OPTIONS;
    "SUBSCRIBE",   SUBSCRIBE;
    "NOTIFY",      NOTIFY;
    "INFO",        INFO;
    "REFER",       REFER;
    "MESSAGE",     MESSAGE;
}

impl Method {
    pub fn parse(src: &Bytes) -> impl Fn(&str) -> IResult<'_, Self> + '_ {
        move |i| map(take_while1(token), |slice| Self::from_parse(src, slice))(i)
    }
}

impl From<&str> for Method {
    fn from(s: &str) -> Self {
        let s = BytesStr::from(s);

        Self::from_parse(s.as_ref(), s.as_ref())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invite_method() {
        assert_eq!(Method::from("INVITE"), Method::INVITE);
        assert_eq!(Method::from("invite"), Method::INVITE);
        assert_eq!(Method::INVITE.to_string(), "INVITE");
    }

    #[test]
    fn other_method() {
        let method = Method::from("SOMEOBSCUREMETHOD");

        assert_eq!(method, Method(Repr::Other("SOMEOBSCUREMETHOD".into())));
        assert_eq!(method.to_string(), "SOMEOBSCUREMETHOD");
    }
}
