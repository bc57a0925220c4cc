use sip_types::StatusCode;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("request timed out")]
    RequestTimedOut,
    #[error("session is already disposed")]
    SessionDisposed,
    #[error("{0}")]
    Other(String),
}

/// ITU-T Q.850 call clearing causes carried in `Reason` headers
pub mod q850 {
    pub const UNALLOCATED_NUMBER: u16 = 1;
    pub const CHANNEL_UNACCEPTABLE: u16 = 6;
    pub const NORMAL_CALL_CLEARING: u16 = 16;
    pub const NO_ANSWER_FROM_USER: u16 = 19;
    pub const NORMAL_UNSPECIFIED: u16 = 31;
    pub const SWITCHING_CONGESTION: u16 = 42;
    pub const TEMPORARY_FAILURE: u16 = 41;
    pub const RESOURCE_UNAVAILABLE: u16 = 47;
    pub const BEARER_CAPABILITY_NOT_IMPLEMENTED: u16 = 65;
    pub const INCOMPATIBLE_DESTINATION: u16 = 88;
    pub const MANDATORY_IE_MISSING: u16 = 96;
}

/// Rich rejection carried from the negotiation layers up to the dialog
/// layer, which maps it onto a response with Warning and Reason headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub code: StatusCode,
    pub cause: u16,
    pub warning: &'static str,
}

impl Reject {
    pub fn new(code: StatusCode, cause: u16, warning: &'static str) -> Self {
        Self {
            code,
            cause,
            warning,
        }
    }

    /// `Warning` header value (RFC 3261 section 20.43)
    pub fn warning_value(&self, host: &str) -> String {
        format!("399 {host} \"{}\"", self.warning)
    }

    /// `Reason` header value (RFC 3326)
    pub fn reason_value(&self) -> String {
        format!("Q.850;cause={}", self.cause)
    }
}

impl std::fmt::Display for Reject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / Q.850 {} ({})", self.code, self.cause, self.warning)
    }
}

impl std::error::Error for Reject {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_values() {
        let reject = Reject::new(
            StatusCode::NOT_ACCEPTABLE_HERE,
            q850::TEMPORARY_FAILURE,
            "No media ports available",
        );

        assert_eq!(reject.reason_value(), "Q.850;cause=41");
        assert_eq!(
            reject.warning_value("192.0.2.1"),
            "399 192.0.2.1 \"No media ports available\""
        );
    }
}
