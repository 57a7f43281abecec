//! # tidepack
//!
//! A schema-driven binary codec for values that carry handles.
//!
//! ## Layout
//!
//! Every object is 8-byte aligned and little-endian. A value has an inline
//! part whose size depends only on its type, and an optional out-of-line
//! part (string bytes, vector elements, boxed structs, envelope payloads)
//! appended after the inline part in depth-first traversal order. Handles
//! travel beside the bytes; the bytes only hold a presence marker where
//! each handle belongs.
//!
//! Unions and tables put their members inside envelopes that record how
//! many bytes and handles the member used, so a reader that does not know a
//! member can keep it as raw data and hand it back unchanged.
//!
//! ## Invariants
//!
//! - Encoding is deterministic: one value always produces the same bytes.
//! - Decoding consumes every byte and every handle, or fails.
//! - Padding is zero, and decoding rejects it otherwise.
//! - On failure, every handle passed in is closed exactly once.

pub mod types;
pub mod handle;
pub mod schema;
pub mod value;
pub mod encoder;
pub mod decoder;

pub use types::Result;
pub use types::Error;

pub use handle::Handle;
pub use handle::HandleTable;

pub use schema::BitsType;
pub use schema::EnumType;
pub use schema::Member;
pub use schema::Primitive;
pub use schema::StructField;
pub use schema::StructType;
pub use schema::TableType;
pub use schema::Type;
pub use schema::UnionType;

pub use value::TableValue;
pub use value::UnionValue;
pub use value::UnknownData;
pub use value::Value;

pub use encoder::Encoder;
pub use decoder::Decoder;

/// Encodes `value` as a top-level object of type `ty`.
pub fn encode(value: Value, ty: &Type) -> Result<(Vec<u8>, Vec<Handle>)> {
    let mut encoder = Encoder::new();
    encoder.encode(value, ty)?;
    Ok(encoder.finish())
}

/// Decodes a top-level object of type `ty`. Consumes `handles`; on error they are closed.
pub fn decode(bytes: &[u8], handles: Vec<Handle>, ty: &Type) -> Result<Value> {
    Decoder::decode(bytes, handles, ty)
}
