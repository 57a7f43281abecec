//! # Status Codes
//!
//! Kernel-style status values. Negative values are errors, zero is success.
//! Epitaphs carry one of these as the reason a channel was closed.

/// A kernel-style status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const OK: Status = Status(0);
    pub const INTERNAL: Status = Status(-1);
    pub const NOT_SUPPORTED: Status = Status(-2);
    pub const INVALID_ARGS: Status = Status(-10);
    pub const BAD_STATE: Status = Status(-20);
    pub const CANCELED: Status = Status(-23);
    pub const PEER_CLOSED: Status = Status(-24);
    pub const UNAVAILABLE: Status = Status(-28);
    pub const IO: Status = Status(-40);
    pub const PROTOCOL_NOT_SUPPORTED: Status = Status(-70);

    pub fn from_raw(raw: i32) -> Self {
        Status(raw)
    }

    pub fn into_raw(self) -> i32 {
        self.0
    }

    pub fn is_ok(self) -> bool {
        self == Status::OK
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Status::OK => "OK",
            Status::INTERNAL => "INTERNAL",
            Status::NOT_SUPPORTED => "NOT_SUPPORTED",
            Status::INVALID_ARGS => "INVALID_ARGS",
            Status::BAD_STATE => "BAD_STATE",
            Status::CANCELED => "CANCELED",
            Status::PEER_CLOSED => "PEER_CLOSED",
            Status::UNAVAILABLE => "UNAVAILABLE",
            Status::IO => "IO",
            Status::PROTOCOL_NOT_SUPPORTED => "PROTOCOL_NOT_SUPPORTED",
            _ => return None,
        };
        Some(name)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "STATUS({})", self.0),
        }
    }
}
