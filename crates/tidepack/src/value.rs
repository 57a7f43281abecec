//! Dynamic values that the encoder consumes and the decoder produces.

use std::collections::BTreeMap;

use crate::handle::Handle;

/// A decoded (or to-be-encoded) value. Its shape is interpreted against a
/// `Type`; handles inside a value are owned by it.
#[derive(Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    /// A `vector<u8>` or `array<u8>`.
    Bytes(Vec<u8>),
    Vector(Vec<Value>),
    Array(Vec<Value>),
    Handle(Handle),
    Bits(u64),
    Enum(u64),
    Struct(Vec<Value>),
    Union(UnionValue),
    Table(TableValue),
    /// An absent nullable string, vector, handle, union, or boxed struct.
    Null,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::String(s.into())
    }

    pub fn union(ordinal: u64, value: Value) -> Value {
        Value::Union(UnionValue::Known { ordinal, value: Box::new(value) })
    }

    /// The success arm of a result union.
    pub fn ok(value: Value) -> Value {
        Value::union(1, value)
    }

    /// The domain-error arm of a result union.
    pub fn err(value: Value) -> Value {
        Value::union(2, value)
    }

    pub fn empty_struct() -> Value {
        Value::Struct(Vec::new())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Vector(_) => "vector",
            Value::Array(_) => "array",
            Value::Handle(_) => "handle",
            Value::Bits(_) => "bits",
            Value::Enum(_) => "enum",
            Value::Struct(_) => "struct",
            Value::Union(_) => "union",
            Value::Table(_) => "table",
            Value::Null => "null",
        }
    }

    /// Borrow a struct field by index.
    pub fn field(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.get(index),
            _ => None,
        }
    }

    /// Move the fields out of a struct value.
    pub fn into_fields(self) -> Option<Vec<Value>> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum UnionValue {
    Known { ordinal: u64, value: Box<Value> },
    /// A variant of a flexible union this schema does not know.
    Unknown(UnknownData),
}

impl UnionValue {
    pub fn ordinal(&self) -> u64 {
        match self {
            UnionValue::Known { ordinal, .. } => *ordinal,
            UnionValue::Unknown(data) => data.ordinal,
        }
    }
}

/// The raw envelope payload of an unknown union variant or table field,
/// kept so it can be re-encoded byte-for-byte.
#[derive(Debug, PartialEq)]
pub struct UnknownData {
    pub ordinal: u64,
    pub bytes: Vec<u8>,
    pub handles: Vec<Handle>,
}

#[derive(Debug, Default, PartialEq)]
pub struct TableValue {
    pub fields: BTreeMap<u64, Value>,
    pub unknown: BTreeMap<u64, UnknownData>,
}

impl TableValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ordinal: u64, value: Value) -> Self {
        self.fields.insert(ordinal, value);
        self
    }

    pub fn get(&self, ordinal: u64) -> Option<&Value> {
        self.fields.get(&ordinal)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.unknown.is_empty()
    }
}
