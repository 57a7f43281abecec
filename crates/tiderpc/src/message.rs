//! # Messages
//!
//! A message is a header followed by a payload struct, plus the handles the
//! payload carries. Requests, responses, and events all share this shape;
//! only the header tells them apart.
//!
//! ## Invariants
//!
//! - An empty parameter list encodes as a zero-byte payload, so a message
//!   with no parameters is exactly one header long.
//! - An epitaph is a header with `EPITAPH_ORDINAL` and txid 0, followed by
//!   an `i32` status padded to 8 bytes. It never carries handles.

use tidepack::Decoder;
use tidepack::Encoder;
use tidepack::Handle;
use tidepack::StructType;
use tidepack::Type;
use tidepack::Value;

use crate::error::Error;
use crate::error::Result;
use crate::header::HEADER_SIZE;
use crate::header::PersistentHeader;
use crate::header::TransactionHeader;
use crate::status::Status;

/// Raw bytes and handles of one message, as they travel over a channel.
#[derive(Debug, Default, PartialEq)]
pub struct MessageBuf {
    pub bytes: Vec<u8>,
    pub handles: Vec<Handle>,
}

impl MessageBuf {
    pub fn new(bytes: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self { bytes, handles }
    }

    pub fn header(&self) -> Result<TransactionHeader> {
        TransactionHeader::decode(&self.bytes).map(|(header, _)| header)
    }

    /// Payload bytes after the header; empty if the message is too short.
    pub fn body(&self) -> &[u8] {
        self.bytes.get(HEADER_SIZE..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encodes a header and payload. `payload` must be a struct value matching `decl`.
pub fn encode_message(txid: u32, ordinal: u64, payload: Value, decl: &StructType) -> Result<MessageBuf> {
    encode_with_header(TransactionHeader::new(txid, ordinal), payload, decl)
}

/// Like `encode_message`, with full control over the header (flags included).
pub fn encode_with_header(header: TransactionHeader, payload: Value, decl: &StructType) -> Result<MessageBuf> {
    let mut encoder = Encoder::with_capacity(HEADER_SIZE + decl.size());
    encoder.write_raw(&header.encode());
    if decl.is_empty() {
        match payload {
            Value::Struct(fields) if fields.is_empty() => {}
            other => {
                return Err(tidepack::Error::SchemaMismatch { expected: "empty struct", found: other.kind() }.into());
            }
        }
    } else {
        encoder.encode_struct(payload, decl)?;
    }
    let (bytes, handles) = encoder.finish();
    Ok(MessageBuf { bytes, handles })
}

/// Decodes a payload that has already been split from its header.
/// Takes ownership of `handles`; they are closed on error.
pub fn decode_body(body: &[u8], handles: Vec<Handle>, decl: &StructType) -> Result<Value> {
    if decl.is_empty() && body.is_empty() {
        if !handles.is_empty() {
            return Err(tidepack::Error::ExtraHandles.into());
        }
        return Ok(Value::empty_struct());
    }
    Ok(Decoder::decode_struct(body, handles, decl)?)
}

/// Decodes a whole message, checking its magic number and ordinal.
pub fn decode_message(message: MessageBuf, expected_ordinal: u64, decl: &StructType) -> Result<(TransactionHeader, Value)> {
    let MessageBuf { bytes, handles } = message;
    let (header, body) = TransactionHeader::decode(&bytes)?;
    header.validate()?;
    if header.ordinal != expected_ordinal {
        return Err(Error::UnexpectedOrdinal { expected: expected_ordinal, found: header.ordinal });
    }
    let value = decode_body(body, handles, decl)?;
    Ok((header, value))
}

fn epitaph_decl() -> StructType {
    StructType::new("Epitaph", vec![("error", Type::I32)])
}

pub fn encode_epitaph(status: Status) -> MessageBuf {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + 8);
    bytes.extend_from_slice(&TransactionHeader::epitaph().encode());
    bytes.extend_from_slice(&status.into_raw().to_le_bytes());
    bytes.extend_from_slice(&[0; 4]);
    MessageBuf { bytes, handles: Vec::new() }
}

/// Decodes the body of an epitaph message into its status.
pub fn decode_epitaph_body(body: &[u8], handles: Vec<Handle>) -> Result<Status> {
    let value = Decoder::decode_struct(body, handles, &epitaph_decl())?;
    match value.field(0) {
        Some(Value::I32(raw)) => Ok(Status(*raw)),
        _ => Err(tidepack::Error::SchemaMismatch { expected: "i32", found: "struct" }.into()),
    }
}

/// Encodes a value for storage outside any transaction. Handles are refused.
pub fn encode_persistent(value: Value, decl: &StructType) -> Result<Vec<u8>> {
    let mut encoder = Encoder::with_capacity(HEADER_SIZE + decl.size());
    encoder.write_raw(&PersistentHeader::new().encode());
    encoder.encode_struct(value, decl)?;
    let (bytes, handles) = encoder.finish();
    if !handles.is_empty() {
        return Err(Error::HandlesNotAllowed(handles.len()));
    }
    Ok(bytes)
}

pub fn decode_persistent(bytes: &[u8], decl: &StructType) -> Result<Value> {
    let (_, body) = PersistentHeader::decode(bytes)?;
    Ok(Decoder::decode_struct(body, Vec::new(), decl)?)
}
