//! # Error Definitions
//!
//! Failures while framing or unframing a message.

use tidepack::Error as PackError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The payload failed to encode or decode.
    Codec(PackError),
    /// The message is shorter than a header.
    TooShort(usize),
    /// The header's magic number is not one this library speaks.
    IncompatibleMagic(u8),
    /// The header names a different method than the one expected.
    UnexpectedOrdinal { expected: u64, found: u64 },
    /// A persistent header had bytes set outside its flags and magic.
    InvalidPersistentHeader,
    /// Persistent data cannot carry handles.
    HandlesNotAllowed(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "codec error: {}", e),
            Error::TooShort(len) => write!(f, "message of {} bytes is shorter than a header", len),
            Error::IncompatibleMagic(magic) => write!(f, "incompatible magic number {}", magic),
            Error::UnexpectedOrdinal { expected, found } => write!(f, "expected ordinal {:#x}, found {:#x}", expected, found),
            Error::InvalidPersistentHeader => write!(f, "invalid persistent header"),
            Error::HandlesNotAllowed(n) => write!(f, "persistent data cannot carry handles ({} given)", n),
        }
    }
}

impl std::error::Error for Error {}

impl From<PackError> for Error {
    fn from(e: PackError) -> Self {
        Self::Codec(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
