use std::collections::BTreeMap;

use crate::handle::Handle;
use crate::schema::Member;
use crate::schema::StructType;
use crate::schema::Type;
use crate::types::ALLOC_PRESENT_U32;
use crate::types::ALLOC_PRESENT_U64;
use crate::types::ENVELOPE_SIZE;
use crate::types::Error;
use crate::types::MAX_RECURSION;
use crate::types::OBJECT_ALIGNMENT;
use crate::types::Result;
use crate::types::round_up_to_align;
use crate::value::TableValue;
use crate::value::UnionValue;
use crate::value::UnknownData;
use crate::value::Value;

/// A growable, zero-filled arena that encodes values into the tidepack
/// format. Every object is allocated at the current end of the buffer,
/// rounded up to 8 bytes, so out-of-line data lands in depth-first order.
pub struct Encoder {
    buf: Vec<u8>,
    handles: Vec<Handle>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new(), handles: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap), handles: Vec::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Appends pre-encoded bytes, such as a message header.
    /// `bytes` must keep the buffer 8-byte aligned.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() % OBJECT_ALIGNMENT == 0);
        self.buf.extend_from_slice(bytes);
    }

    /// Encodes `value` as a top-level object of type `ty`.
    pub fn encode(&mut self, value: Value, ty: &Type) -> Result<()> {
        let offset = self.alloc(ty.inline_size());
        self.encode_value(value, ty, offset, 0)
    }

    /// Encodes the fields of a struct value as a top-level object.
    pub fn encode_struct(&mut self, value: Value, decl: &StructType) -> Result<()> {
        let offset = self.alloc(decl.size());
        self.encode_struct_at(value, decl, offset, 0)
    }

    pub fn finish(self) -> (Vec<u8>, Vec<Handle>) {
        (self.buf, self.handles)
    }

    // Allocation

    fn alloc(&mut self, len: usize) -> usize {
        let start = self.buf.len();
        self.buf.resize(start + round_up_to_align(len, OBJECT_ALIGNMENT), 0);
        start
    }

    fn write_out_of_line<F>(&mut self, len: usize, depth: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self, usize, usize) -> Result<()>,
    {
        let depth = depth + 1;
        if depth > MAX_RECURSION {
            return Err(Error::MaxRecursionDepth);
        }
        let offset = self.alloc(len);
        f(self, offset, depth)
    }

    #[inline]
    fn put(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[inline]
    fn put_u32(&mut self, offset: usize, v: u32) {
        self.put(offset, &v.to_le_bytes());
    }

    #[inline]
    fn put_u64(&mut self, offset: usize, v: u64) {
        self.put(offset, &v.to_le_bytes());
    }

    fn put_unsigned(&mut self, offset: usize, size: usize, v: u64) {
        let bytes = v.to_le_bytes();
        self.put(offset, &bytes[..size]);
    }

    // Values

    fn encode_value(&mut self, value: Value, ty: &Type, offset: usize, depth: usize) -> Result<()> {
        match (ty, value) {
            (Type::Bool, Value::Bool(v)) => self.put(offset, &[v as u8]),
            (Type::U8, Value::U8(v)) => self.put(offset, &[v]),
            (Type::U16, Value::U16(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::U32, Value::U32(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::U64, Value::U64(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::I8, Value::I8(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::I16, Value::I16(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::I32, Value::I32(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::I64, Value::I64(v)) => self.put(offset, &v.to_le_bytes()),
            (Type::F32, Value::F32(v)) => self.put(offset, &v.to_bits().to_le_bytes()),
            (Type::F64, Value::F64(v)) => self.put(offset, &v.to_bits().to_le_bytes()),

            (Type::String { max_len, .. }, Value::String(s)) => {
                if let Some(max) = max_len {
                    if s.len() > *max as usize {
                        return Err(Error::StringTooLong { len: s.len(), max: *max });
                    }
                }
                self.encode_byte_vector(s.as_bytes(), offset, depth)?;
            }

            (Type::Vector { element, max_len, .. }, Value::Bytes(bytes)) if **element == Type::U8 => {
                check_vector_len(bytes.len(), *max_len)?;
                self.encode_byte_vector(&bytes, offset, depth)?;
            }

            (Type::Vector { element, max_len, .. }, Value::Vector(items)) => {
                check_vector_len(items.len(), *max_len)?;
                self.put_u64(offset, items.len() as u64);
                self.put_u64(offset + 8, ALLOC_PRESENT_U64);
                if !items.is_empty() {
                    let stride = element.inline_size();
                    self.write_out_of_line(stride * items.len(), depth, |e, start, depth| {
                        for (i, item) in items.into_iter().enumerate() {
                            e.encode_value(item, element, start + i * stride, depth)?;
                        }
                        Ok(())
                    })?;
                }
            }

            (Type::Array { element, len }, Value::Bytes(bytes)) if **element == Type::U8 => {
                if bytes.len() != *len {
                    return Err(Error::ArrayLength { expected: *len, found: bytes.len() });
                }
                self.put(offset, &bytes);
            }

            (Type::Array { element, len }, Value::Array(items)) => {
                if items.len() != *len {
                    return Err(Error::ArrayLength { expected: *len, found: items.len() });
                }
                let stride = element.inline_size();
                for (i, item) in items.into_iter().enumerate() {
                    self.encode_value(item, element, offset + i * stride, depth)?;
                }
            }

            (Type::Handle { .. }, Value::Handle(handle)) => {
                self.put_u32(offset, ALLOC_PRESENT_U32);
                self.handles.push(handle);
            }

            (Type::Bits(bits), Value::Bits(v)) => {
                if v & !bits.mask != 0 {
                    return Err(Error::InvalidBits(v));
                }
                self.put_unsigned(offset, bits.primitive.size(), v);
            }

            (Type::Enum(decl), Value::Enum(v)) => {
                if v > decl.primitive.max_value() || (decl.strict && !decl.is_member(v)) {
                    return Err(Error::InvalidEnumValue(v));
                }
                self.put_unsigned(offset, decl.primitive.size(), v);
            }

            (Type::Struct(decl), value @ Value::Struct(_)) => {
                self.encode_struct_at(value, decl, offset, depth)?;
            }

            (Type::Boxed(decl), value @ Value::Struct(_)) => {
                self.put_u64(offset, ALLOC_PRESENT_U64);
                self.write_out_of_line(decl.size(), depth, |e, start, depth| {
                    e.encode_struct_at(value, decl, start, depth)
                })?;
            }

            (Type::Union { decl, .. }, Value::Union(UnionValue::Known { ordinal, value })) => {
                let member = decl.member(ordinal).ok_or(Error::UnknownMember(ordinal))?;
                self.put_u64(offset, ordinal);
                self.encode_envelope(*value, &member.ty, offset + 8, depth)?;
            }

            (Type::Union { decl, .. }, Value::Union(UnionValue::Unknown(data))) => {
                if decl.strict {
                    return Err(Error::UnknownUnionTag(data.ordinal));
                }
                if data.ordinal == 0 || decl.member(data.ordinal).is_some() {
                    return Err(Error::InvalidUnknownData(data.ordinal));
                }
                self.put_u64(offset, data.ordinal);
                self.encode_unknown_envelope(data, offset + 8, depth)?;
            }

            (Type::Table(decl), Value::Table(table)) => {
                self.encode_table(table, &decl.members, offset, depth)?;
            }

            // Absent values leave the zero-filled inline slot as it is.
            (ty, Value::Null) => {
                if !ty.is_nullable() {
                    return Err(Error::NotNullable);
                }
            }

            (ty, value) => {
                return Err(Error::SchemaMismatch { expected: ty.kind(), found: value.kind() });
            }
        }
        Ok(())
    }

    fn encode_byte_vector(&mut self, bytes: &[u8], offset: usize, depth: usize) -> Result<()> {
        self.put_u64(offset, bytes.len() as u64);
        self.put_u64(offset + 8, ALLOC_PRESENT_U64);
        if bytes.is_empty() {
            return Ok(());
        }
        self.write_out_of_line(bytes.len(), depth, |e, start, _| {
            e.put(start, bytes);
            Ok(())
        })
    }

    fn encode_struct_at(&mut self, value: Value, decl: &StructType, offset: usize, depth: usize) -> Result<()> {
        let fields = match value {
            Value::Struct(fields) => fields,
            other => return Err(Error::SchemaMismatch { expected: "struct", found: other.kind() }),
        };
        if fields.len() != decl.fields().len() {
            return Err(Error::FieldCount { expected: decl.fields().len(), found: fields.len() });
        }
        for (field, value) in decl.fields().iter().zip(fields) {
            self.encode_value(value, &field.ty, offset + field.offset, depth)?;
        }
        Ok(())
    }

    /// Writes a present envelope at `offset` whose payload is `value`.
    fn encode_envelope(&mut self, value: Value, ty: &Type, offset: usize, depth: usize) -> Result<()> {
        let bytes_before = self.buf.len();
        let handles_before = self.handles.len();

        self.write_out_of_line(ty.inline_size(), depth, |e, start, depth| e.encode_value(value, ty, start, depth))?;

        let num_bytes = self.buf.len() - bytes_before;
        let num_handles = self.handles.len() - handles_before;
        self.put_u32(offset, num_bytes as u32);
        self.put_u32(offset + 4, num_handles as u32);
        self.put_u64(offset + 8, ALLOC_PRESENT_U64);
        Ok(())
    }

    fn encode_unknown_envelope(&mut self, data: UnknownData, offset: usize, depth: usize) -> Result<()> {
        if data.bytes.len() % OBJECT_ALIGNMENT != 0 {
            return Err(Error::InvalidUnknownData(data.ordinal));
        }
        if !data.bytes.is_empty() && depth + 1 > MAX_RECURSION {
            return Err(Error::MaxRecursionDepth);
        }
        let start = self.alloc(data.bytes.len());
        self.put(start, &data.bytes);
        self.put_u32(offset, data.bytes.len() as u32);
        self.put_u32(offset + 4, data.handles.len() as u32);
        self.put_u64(offset + 8, ALLOC_PRESENT_U64);
        self.handles.extend(data.handles);
        Ok(())
    }

    /// Tables are a vector of envelopes indexed by `ordinal - 1`, as long as
    /// the highest present ordinal.
    fn encode_table(&mut self, table: TableValue, members: &[Member], offset: usize, depth: usize) -> Result<()> {
        let TableValue { fields, unknown } = table;

        let mut entries: BTreeMap<u64, TableEntry> = BTreeMap::new();
        for (ordinal, value) in fields {
            let member = members
                .iter()
                .find(|m| m.ordinal == ordinal)
                .ok_or(Error::UnknownMember(ordinal))?;
            entries.insert(ordinal, TableEntry::Known(value, &member.ty));
        }
        for (ordinal, data) in unknown {
            if ordinal == 0 || ordinal != data.ordinal || entries.contains_key(&ordinal) || members.iter().any(|m| m.ordinal == ordinal) {
                return Err(Error::InvalidUnknownData(ordinal));
            }
            entries.insert(ordinal, TableEntry::Unknown(data));
        }

        let max_ordinal = entries.keys().next_back().copied().unwrap_or(0);
        self.put_u64(offset, max_ordinal);
        self.put_u64(offset + 8, ALLOC_PRESENT_U64);
        if max_ordinal == 0 {
            return Ok(());
        }

        let envelopes_len = u32::try_from(max_ordinal)
            .ok()
            .and_then(|n| (n as usize).checked_mul(ENVELOPE_SIZE))
            .ok_or(Error::InvalidUnknownData(max_ordinal))?;
        self.write_out_of_line(envelopes_len, depth, |e, start, depth| {
            for (ordinal, entry) in entries {
                let envelope = start + (ordinal as usize - 1) * ENVELOPE_SIZE;
                match entry {
                    TableEntry::Known(value, ty) => e.encode_envelope(value, ty, envelope, depth)?,
                    TableEntry::Unknown(data) => e.encode_unknown_envelope(data, envelope, depth)?,
                }
            }
            Ok(())
        })
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

enum TableEntry<'a> {
    Known(Value, &'a Type),
    Unknown(UnknownData),
}

fn check_vector_len(len: usize, max_len: Option<u32>) -> Result<()> {
    match max_len {
        Some(max) if len > max as usize => Err(Error::VectorTooLong { len, max }),
        _ => Ok(()),
    }
}
