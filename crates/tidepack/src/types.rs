//! Core types for the tidepack wire format

/// Presence marker for a present out-of-line object or envelope.
pub const ALLOC_PRESENT_U64: u64 = u64::MAX;
/// Presence marker for an absent out-of-line object or envelope.
pub const ALLOC_ABSENT_U64: u64 = 0;
/// Presence marker for a present handle.
pub const ALLOC_PRESENT_U32: u32 = u32::MAX;
/// Presence marker for an absent handle.
pub const ALLOC_ABSENT_U32: u32 = 0;

/// Maximum out-of-line nesting depth.
pub const MAX_RECURSION: usize = 32;

/// Inline size of an envelope: `num_bytes: u32`, `num_handles: u32`, `presence: u64`.
pub const ENVELOPE_SIZE: usize = 16;

/// Every object on the wire starts on this boundary.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Rounds `x` up to the next multiple of `align` (a power of two).
#[inline]
pub fn round_up_to_align(x: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (x + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The buffer ended before the object it should contain.
    OutOfRange,
    /// Bytes remain after the last out-of-line object.
    ExtraBytes,
    /// Handles remain after the whole value was decoded.
    ExtraHandles,
    /// The value references more handles than the message carries.
    TooFewHandles,
    /// A padding byte was not zero.
    NonZeroPadding { padding_start: usize, non_zero_pos: usize },
    /// A presence marker was neither present nor absent, or disagrees with its count.
    InvalidPresenceIndicator,
    /// An absent value was found where the schema does not allow one.
    NotNullable,
    /// A strict union had no variant set.
    UnsetUnion,
    /// A bool byte was neither 0 nor 1.
    InvalidBoolean,
    InvalidUtf8,
    StringTooLong { len: usize, max: u32 },
    VectorTooLong { len: usize, max: u32 },
    ArrayLength { expected: usize, found: usize },
    /// A strict union carried an ordinal the schema does not know.
    UnknownUnionTag(u64),
    /// A strict enum carried a value the schema does not know.
    InvalidEnumValue(u64),
    /// A bits value set bits outside the schema's mask (encode only).
    InvalidBits(u64),
    /// The envelope's declared byte count disagrees with its content.
    EnvelopeBytesMismatch { declared: u32, actual: usize },
    /// The envelope's declared handle count disagrees with its content.
    EnvelopeHandlesMismatch { declared: u32, actual: usize },
    MaxRecursionDepth,
    /// The value's shape does not match the schema (encode only).
    SchemaMismatch { expected: &'static str, found: &'static str },
    /// A struct value has the wrong number of fields (encode only).
    FieldCount { expected: usize, found: usize },
    /// A union or table member ordinal is not part of the schema (encode only).
    UnknownMember(u64),
    /// Retained unknown data cannot be re-encoded in this position.
    InvalidUnknownData(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::OutOfRange => write!(f, "buffer too short"),
            Error::ExtraBytes => write!(f, "extra bytes after the last object"),
            Error::ExtraHandles => write!(f, "extra handles after decoding"),
            Error::TooFewHandles => write!(f, "too few handles"),
            Error::NonZeroPadding { padding_start, non_zero_pos } => write!(f, "non-zero padding byte at {} (padding starts at {})", non_zero_pos, padding_start),
            Error::InvalidPresenceIndicator => write!(f, "invalid presence indicator"),
            Error::NotNullable => write!(f, "absent value for a non-nullable type"),
            Error::UnsetUnion => write!(f, "union has no variant set"),
            Error::InvalidBoolean => write!(f, "invalid boolean"),
            Error::InvalidUtf8 => write!(f, "string is not valid utf-8"),
            Error::StringTooLong { len, max } => write!(f, "string of {} bytes exceeds bound {}", len, max),
            Error::VectorTooLong { len, max } => write!(f, "vector of {} elements exceeds bound {}", len, max),
            Error::ArrayLength { expected, found } => write!(f, "array expects {} elements, found {}", expected, found),
            Error::UnknownUnionTag(ordinal) => write!(f, "unknown ordinal {:#x} in strict union", ordinal),
            Error::InvalidEnumValue(v) => write!(f, "invalid enum value {}", v),
            Error::InvalidBits(v) => write!(f, "bits value {:#x} sets unknown bits", v),
            Error::EnvelopeBytesMismatch { declared, actual } => write!(f, "envelope declares {} bytes, content used {}", declared, actual),
            Error::EnvelopeHandlesMismatch { declared, actual } => write!(f, "envelope declares {} handles, content used {}", declared, actual),
            Error::MaxRecursionDepth => write!(f, "exceeded maximum nesting depth {}", MAX_RECURSION),
            Error::SchemaMismatch { expected, found } => write!(f, "expected a {} value, found {}", expected, found),
            Error::FieldCount { expected, found } => write!(f, "struct expects {} fields, found {}", expected, found),
            Error::UnknownMember(ordinal) => write!(f, "member ordinal {} is not in the schema", ordinal),
            Error::InvalidUnknownData(ordinal) => write!(f, "unknown data for ordinal {} cannot be encoded here", ordinal),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
