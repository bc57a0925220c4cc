use std::fmt;
use std::str::FromStr;

type Repr = u16;

/// A SIP status code encoded in an u16
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StatusCode(Repr);

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tuple = f.debug_tuple("StatusCode");
        tuple.field(&self.0);
        if let Some(text) = self.text() {
            tuple.field(&text);
        }
        tuple.finish()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The kind of a SIP status code for broader handling
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CodeKind {
    /// Represents code 100..=199
    Provisional,

    /// Represents code 200..=299
    Success,

    /// Represents code 300..=399
    Redirection,

    /// Represents code 400..=499
    RequestFailure,

    /// Represents code 500..=599
    ServerFailure,

    /// Represents code 600..=699
    GlobalFailure,

    /// Represents all other codes
    Custom,
}

impl StatusCode {
    #[inline]
    pub fn kind(self) -> CodeKind {
        match self.0 {
            100..=199 => CodeKind::Provisional,
            200..=299 => CodeKind::Success,
            300..=399 => CodeKind::Redirection,
            400..=499 => CodeKind::RequestFailure,
            500..=599 => CodeKind::ServerFailure,
            600..=699 => CodeKind::GlobalFailure,
            _ => CodeKind::Custom,
        }
    }

    pub fn into_u16(self) -> Repr {
        self.0
    }

    /// Any final response, i.e. not a provisional one
    pub fn is_final(self) -> bool {
        self.0 >= 200
    }

    /// A final negative response (3XX-6XX)
    pub fn is_negative(self) -> bool {
        self.0 >= 300
    }
}

impl FromStr for StatusCode {
    type Err = <Repr as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StatusCode(Repr::from_str(s)?))
    }
}

impl From<Repr> for StatusCode {
    fn from(r: Repr) -> StatusCode {
        StatusCode(r)
    }
}

macro_rules! codes {
    ($($(#[$comments:meta])* [$code:expr => $name:ident, $text:literal];)*) => {
        impl StatusCode {
            /// Returns the default response-text for a known code
            pub fn text(self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some($text),)*
                    _ => None
                }
            }

            $(
            $(#[$comments])*
            pub const $name: StatusCode = StatusCode($code);
            )*
        }
    };
}

codes! {
    /// 100 Trying
    [100 => TRYING, "Trying"];

    /// 180 Ringing
    [180 => RINGING, "Ringing"];

    /// 181 Call Is Being Forwarded
    [181 => CALL_IS_BEING_FORWARDED, "Call Is Being Forwarded"];

    /// 182 Queued
    [182 => QUEUED, "Queued"];

    /// 183 Session Progress
    [183 => SESSION_PROGRESS, "Session Progress"];

    /// 200 OK
    [200 => OK, "OK"];

    /// 202 Accepted
    [202 => ACCEPTED, "Accepted"];

    /// 300 Multiple Choices
    [300 => MULTIPLE_CHOICES, "Multiple Choices"];

    /// 301 Moved Permanently
    [301 => MOVED_PERMANENTLY, "Moved Permanently"];

    /// 302 Moved Temporarily
    [302 => MOVED_TEMPORARILY, "Moved Temporarily"];

    /// 400 Bad Request
    [400 => BAD_REQUEST, "Bad Request"];

    /// 401 Unauthorized
    [401 => UNAUTHORIZED, "Unauthorized"];

    /// 403 Forbidden
    [403 => FORBIDDEN, "Forbidden"];

    /// 404 Not Found
    [404 => NOT_FOUND, "Not Found"];

    /// 405 Method Not Allowed
    [405 => METHOD_NOT_ALLOWED, "Method Not Allowed"];

    /// 408 Request Timeout
    [408 => REQUEST_TIMEOUT, "Request Timeout"];

    /// 415 Unsupported Media Type
    [415 => UNSUPPORTED_MEDIA_TYPE, "Unsupported Media Type"];

    /// 481 Call/Transaction Does Not Exist
    [481 => CALL_OR_TRANSACTION_DOES_NOT_EXIST, "Call/Transaction Does Not Exist"];

    /// 486 Busy Here
    [486 => BUSY_HERE, "Busy Here"];

    /// 487 Request Terminated
    [487 => REQUEST_TERMINATED, "Request Terminated"];

    /// 488 Not Acceptable Here
    [488 => NOT_ACCEPTABLE_HERE, "Not Acceptable Here"];

    /// 491 Request Pending
    [491 => REQUEST_PENDING, "Request Pending"];

    /// 500 Server Internal Error
    [500 => SERVER_INTERNAL_ERROR, "Server Internal Error"];

    /// 501 Not Implemented
    [501 => NOT_IMPLEMENTED, "Not Implemented"];

    /// 503 Service Unavailable
    [503 => SERVICE_UNAVAILABLE, "Service Unavailable"];

    /// 504 Server Time-out
    [504 => SERVER_TIMEOUT, "Server Time-out"];

    /// 600 Busy Everywhere
    [600 => BUSY_EVERYWHERE, "Busy Everywhere"];

    /// 603 Decline
    [603 => DECLINE, "Decline"];

    /// 604 Does Not Exist Anywhere
    [604 => DOES_NOT_EXIST_ANYWHERE, "Does Not Exist Anywhere"];

    /// 606 Not Acceptable
    [606 => NOT_ACCEPTABLE, "Not Acceptable"];
}

impl StatusCode {
    /// Reason phrase: the known text, or the x00 default of the class
    pub fn reason_phrase(self) -> &'static str {
        if let Some(text) = self.text() {
            return text;
        }

        match self.kind() {
            CodeKind::Provisional => "Trying",
            CodeKind::Success => "OK",
            CodeKind::Redirection => "Multiple Choices",
            CodeKind::RequestFailure => "Bad Request",
            CodeKind::ServerFailure => "Server Internal Error",
            CodeKind::GlobalFailure => "Busy Everywhere",
            CodeKind::Custom => "Unknown",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(StatusCode::RINGING.kind(), CodeKind::Provisional);
        assert_eq!(StatusCode::OK.kind(), CodeKind::Success);
        assert_eq!(StatusCode::NOT_ACCEPTABLE_HERE.kind(), CodeKind::RequestFailure);
        assert!(StatusCode::from(488).is_negative());
        assert!(!StatusCode::from(183).is_final());
    }

    #[test]
    fn reason_phrases() {
        assert_eq!(StatusCode::OK.reason_phrase(), "OK");
        assert_eq!(StatusCode::from(499).reason_phrase(), "Bad Request");
        assert_eq!(StatusCode::from(183).text(), Some("Session Progress"));
    }
}
