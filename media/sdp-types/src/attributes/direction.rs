use std::fmt;

/// Media direction attribute (`a=sendrecv` ...)
///
/// [RFC8866](https://www.rfc-editor.org/rfc/rfc8866.html#section-6.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    RecvOnly,
    SendOnly,
    Inactive,
}

impl Direction {
    pub fn from_attribute(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(Direction::SendRecv),
            "recvonly" => Some(Direction::RecvOnly),
            "sendonly" => Some(Direction::SendOnly),
            "inactive" => Some(Direction::Inactive),
            _ => None,
        }
    }

    /// Direction of the answer when this is the offered direction and the
    /// answerer is willing to both send and receive
    pub fn flipped(self) -> Self {
        match self {
            Direction::SendRecv => Direction::SendRecv,
            Direction::RecvOnly => Direction::SendOnly,
            Direction::SendOnly => Direction::RecvOnly,
            Direction::Inactive => Direction::Inactive,
        }
    }

    /// An offer which never sends towards us puts the stream on hold
    pub fn is_hold(self) -> bool {
        matches!(self, Direction::SendOnly | Direction::Inactive)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SendRecv => f.write_str("sendrecv"),
            Direction::RecvOnly => f.write_str("recvonly"),
            Direction::SendOnly => f.write_str("sendonly"),
            Direction::Inactive => f.write_str("inactive"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flipping() {
        assert_eq!(Direction::SendRecv.flipped(), Direction::SendRecv);
        assert_eq!(Direction::SendOnly.flipped(), Direction::RecvOnly);
        assert_eq!(Direction::RecvOnly.flipped(), Direction::SendOnly);
        assert_eq!(Direction::Inactive.flipped(), Direction::Inactive);
    }

    #[test]
    fn hold() {
        assert!(Direction::SendOnly.is_hold());
        assert!(Direction::Inactive.is_hold());
        assert!(!Direction::SendRecv.is_hold());
        assert!(!Direction::RecvOnly.is_hold());
    }
}
