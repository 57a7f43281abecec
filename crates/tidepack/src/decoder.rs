use std::collections::VecDeque;

use crate::handle::Handle;
use crate::schema::Member;
use crate::schema::StructType;
use crate::schema::Type;
use crate::types::ALLOC_ABSENT_U32;
use crate::types::ALLOC_ABSENT_U64;
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

/// Decodes and validates a single top-level object.
///
/// The decoder owns the message's handles while it runs. Handles it has not
/// yet moved into a value are closed when it is dropped, so an error at any
/// point closes every handle exactly once: the ones already taken go down
/// with the partially built value, the rest with the decoder.
pub struct Decoder<'a> {
    buf: &'a [u8],
    handles: VecDeque<Handle>,
    next_out_of_line: usize,
}

enum Envelope {
    Absent,
    Known(Value),
    Unknown(Vec<u8>, Vec<Handle>),
}

impl<'a> Decoder<'a> {
    /// Decodes `buf` as one object of type `ty`, consuming every byte and handle.
    pub fn decode(buf: &'a [u8], handles: Vec<Handle>, ty: &Type) -> Result<Value> {
        let inline = ty.inline_size();
        let mut decoder = Decoder::new(buf, handles, inline)?;
        let value = decoder.decode_value(ty, 0, 0)?;
        decoder.finish(inline)?;
        Ok(value)
    }

    /// Decodes `buf` as the fields of a struct, consuming every byte and handle.
    pub fn decode_struct(buf: &'a [u8], handles: Vec<Handle>, decl: &StructType) -> Result<Value> {
        let mut decoder = Decoder::new(buf, handles, decl.size())?;
        let value = decoder.decode_struct_at(decl, 0, 0)?;
        decoder.finish(decl.size())?;
        Ok(value)
    }

    fn new(buf: &'a [u8], handles: Vec<Handle>, inline: usize) -> Result<Self> {
        let next_out_of_line = round_up_to_align(inline, OBJECT_ALIGNMENT);
        if next_out_of_line > buf.len() {
            return Err(Error::OutOfRange);
        }
        Ok(Self { buf, handles: handles.into(), next_out_of_line })
    }

    fn finish(&self, inline: usize) -> Result<()> {
        self.check_padding(inline, round_up_to_align(inline, OBJECT_ALIGNMENT))?;
        if self.next_out_of_line < self.buf.len() {
            return Err(Error::ExtraBytes);
        }
        if !self.handles.is_empty() {
            return Err(Error::ExtraHandles);
        }
        Ok(())
    }

    // Reading

    fn bytes_at(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset.checked_add(len).ok_or(Error::OutOfRange)?;
        self.buf.get(offset..end).ok_or(Error::OutOfRange)
    }

    fn array_at<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes_at(offset, N)?);
        Ok(out)
    }

    fn u8_at(&self, offset: usize) -> Result<u8> {
        Ok(self.array_at::<1>(offset)?[0])
    }

    fn u32_at(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array_at(offset)?))
    }

    fn u64_at(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array_at(offset)?))
    }

    fn unsigned_at(&self, offset: usize, size: usize) -> Result<u64> {
        let mut out = [0u8; 8];
        out[..size].copy_from_slice(self.bytes_at(offset, size)?);
        Ok(u64::from_le_bytes(out))
    }

    fn check_padding(&self, start: usize, end: usize) -> Result<()> {
        let padding = self.bytes_at(start, end - start)?;
        match padding.iter().position(|b| *b != 0) {
            Some(i) => Err(Error::NonZeroPadding { padding_start: start, non_zero_pos: start + i }),
            None => Ok(()),
        }
    }

    /// Claims the next out-of-line block of `len` bytes and checks its
    /// trailing padding. Returns the block's offset.
    fn read_out_of_line(&mut self, len: usize, depth: usize) -> Result<usize> {
        if len == 0 {
            return Ok(self.next_out_of_line);
        }
        if depth + 1 > MAX_RECURSION {
            return Err(Error::MaxRecursionDepth);
        }
        let start = self.next_out_of_line;
        let padded = len.checked_add(OBJECT_ALIGNMENT - 1).ok_or(Error::OutOfRange)? & !(OBJECT_ALIGNMENT - 1);
        let end = start.checked_add(padded).ok_or(Error::OutOfRange)?;
        if end > self.buf.len() {
            return Err(Error::OutOfRange);
        }
        self.check_padding(start + len, end)?;
        self.next_out_of_line = end;
        Ok(start)
    }

    fn take_handle(&mut self) -> Result<Handle> {
        self.handles.pop_front().ok_or(Error::TooFewHandles)
    }

    // Values

    fn decode_value(&mut self, ty: &Type, offset: usize, depth: usize) -> Result<Value> {
        let value = match ty {
            Type::Bool => match self.u8_at(offset)? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(Error::InvalidBoolean),
            },
            Type::U8 => Value::U8(self.u8_at(offset)?),
            Type::U16 => Value::U16(u16::from_le_bytes(self.array_at(offset)?)),
            Type::U32 => Value::U32(self.u32_at(offset)?),
            Type::U64 => Value::U64(self.u64_at(offset)?),
            Type::I8 => Value::I8(i8::from_le_bytes(self.array_at(offset)?)),
            Type::I16 => Value::I16(i16::from_le_bytes(self.array_at(offset)?)),
            Type::I32 => Value::I32(i32::from_le_bytes(self.array_at(offset)?)),
            Type::I64 => Value::I64(i64::from_le_bytes(self.array_at(offset)?)),
            Type::F32 => Value::F32(f32::from_bits(self.u32_at(offset)?)),
            Type::F64 => Value::F64(f64::from_bits(self.u64_at(offset)?)),

            Type::String { max_len, nullable } => {
                let Some((count, _)) = self.vector_header(offset, *nullable)? else {
                    return Ok(Value::Null);
                };
                if let Some(max) = max_len {
                    if count > *max as u64 {
                        return Err(Error::StringTooLong { len: count as usize, max: *max });
                    }
                }
                let len = usize::try_from(count).map_err(|_| Error::OutOfRange)?;
                let start = self.read_out_of_line(len, depth)?;
                let bytes = self.bytes_at(start, len)?;
                let s = std::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
                Value::String(s.to_string())
            }

            Type::Vector { element, max_len, nullable } => {
                let Some((count, _)) = self.vector_header(offset, *nullable)? else {
                    return Ok(Value::Null);
                };
                if let Some(max) = max_len {
                    if count > *max as u64 {
                        return Err(Error::VectorTooLong { len: count as usize, max: *max });
                    }
                }
                let stride = element.inline_size();
                // Zero-size elements claim no bytes, so bound them by the message instead.
                if stride == 0 && count > self.buf.len() as u64 {
                    return Err(Error::OutOfRange);
                }
                let len = usize::try_from(count)
                    .ok()
                    .and_then(|n| n.checked_mul(stride))
                    .ok_or(Error::OutOfRange)?;
                let start = self.read_out_of_line(len, depth)?;
                if **element == Type::U8 {
                    Value::Bytes(self.bytes_at(start, len)?.to_vec())
                } else {
                    let mut items = Vec::with_capacity(count as usize);
                    for i in 0..count as usize {
                        items.push(self.decode_value(element, start + i * stride, depth + 1)?);
                    }
                    Value::Vector(items)
                }
            }

            Type::Array { element, len } => {
                let stride = element.inline_size();
                if **element == Type::U8 {
                    Value::Bytes(self.bytes_at(offset, *len)?.to_vec())
                } else {
                    let mut items = Vec::with_capacity(*len);
                    for i in 0..*len {
                        items.push(self.decode_value(element, offset + i * stride, depth)?);
                    }
                    Value::Array(items)
                }
            }

            Type::Handle { nullable } => match self.u32_at(offset)? {
                ALLOC_PRESENT_U32 => Value::Handle(self.take_handle()?),
                ALLOC_ABSENT_U32 if *nullable => Value::Null,
                ALLOC_ABSENT_U32 => return Err(Error::NotNullable),
                _ => return Err(Error::InvalidPresenceIndicator),
            },

            Type::Bits(bits) => Value::Bits(self.unsigned_at(offset, bits.primitive.size())? & bits.mask),

            Type::Enum(decl) => {
                let raw = self.unsigned_at(offset, decl.primitive.size())?;
                if decl.strict && !decl.is_member(raw) {
                    return Err(Error::InvalidEnumValue(raw));
                }
                Value::Enum(raw)
            }

            Type::Struct(decl) => self.decode_struct_at(decl, offset, depth)?,

            Type::Boxed(decl) => match self.u64_at(offset)? {
                ALLOC_PRESENT_U64 => {
                    let start = self.read_out_of_line(decl.size(), depth)?;
                    self.decode_struct_at(decl, start, depth + 1)?
                }
                ALLOC_ABSENT_U64 => Value::Null,
                _ => return Err(Error::InvalidPresenceIndicator),
            },

            Type::Union { decl, nullable } => {
                let ordinal = self.u64_at(offset)?;
                if ordinal == 0 {
                    if !matches!(self.decode_envelope(offset + 8, None, depth)?, Envelope::Absent) {
                        return Err(Error::InvalidPresenceIndicator);
                    }
                    if !*nullable {
                        return Err(Error::UnsetUnion);
                    }
                    return Ok(Value::Null);
                }
                match decl.member(ordinal) {
                    Some(member) => match self.decode_envelope(offset + 8, Some(&member.ty), depth)? {
                        Envelope::Known(value) => Value::union(ordinal, value),
                        _ => return Err(Error::InvalidPresenceIndicator),
                    },
                    None if decl.strict => return Err(Error::UnknownUnionTag(ordinal)),
                    None => match self.decode_envelope(offset + 8, None, depth)? {
                        Envelope::Unknown(bytes, handles) => {
                            Value::Union(UnionValue::Unknown(UnknownData { ordinal, bytes, handles }))
                        }
                        _ => return Err(Error::InvalidPresenceIndicator),
                    },
                }
            }

            Type::Table(decl) => self.decode_table(&decl.members, offset, depth)?,
        };
        Ok(value)
    }

    /// Reads a string or vector header. `None` means an absent (null) vector.
    fn vector_header(&self, offset: usize, nullable: bool) -> Result<Option<(u64, u64)>> {
        let count = self.u64_at(offset)?;
        match self.u64_at(offset + 8)? {
            ALLOC_PRESENT_U64 => Ok(Some((count, ALLOC_PRESENT_U64))),
            ALLOC_ABSENT_U64 if count != 0 => Err(Error::InvalidPresenceIndicator),
            ALLOC_ABSENT_U64 if nullable => Ok(None),
            ALLOC_ABSENT_U64 => Err(Error::NotNullable),
            _ => Err(Error::InvalidPresenceIndicator),
        }
    }

    fn decode_struct_at(&mut self, decl: &StructType, offset: usize, depth: usize) -> Result<Value> {
        if decl.is_empty() {
            self.check_padding(offset, offset + 1)?;
            return Ok(Value::Struct(Vec::new()));
        }
        let mut fields = Vec::with_capacity(decl.fields().len());
        let mut cursor = offset;
        for field in decl.fields() {
            let field_offset = offset + field.offset;
            self.check_padding(cursor, field_offset)?;
            fields.push(self.decode_value(&field.ty, field_offset, depth)?);
            cursor = field_offset + field.ty.inline_size();
        }
        self.check_padding(cursor, offset + decl.size())?;
        Ok(Value::Struct(fields))
    }

    fn decode_table(&mut self, members: &[Member], offset: usize, depth: usize) -> Result<Value> {
        let count = self.u64_at(offset)?;
        if self.u64_at(offset + 8)? != ALLOC_PRESENT_U64 {
            return Err(Error::InvalidPresenceIndicator);
        }
        let len = usize::try_from(count)
            .ok()
            .and_then(|n| n.checked_mul(ENVELOPE_SIZE))
            .ok_or(Error::OutOfRange)?;
        let start = self.read_out_of_line(len, depth)?;

        let mut table = TableValue::new();
        for i in 0..count as usize {
            let ordinal = i as u64 + 1;
            let envelope = start + i * ENVELOPE_SIZE;
            let member = members.iter().find(|m| m.ordinal == ordinal);
            match self.decode_envelope(envelope, member.map(|m| &m.ty), depth + 1)? {
                Envelope::Absent => {}
                Envelope::Known(value) => {
                    table.fields.insert(ordinal, value);
                }
                Envelope::Unknown(bytes, handles) => {
                    table.unknown.insert(ordinal, UnknownData { ordinal, bytes, handles });
                }
            }
        }
        Ok(Value::Table(table))
    }

    /// Decodes the envelope at `offset`. With a type, the payload is decoded
    /// and must account for exactly the bytes and handles the envelope
    /// declares. Without one, the payload is kept as raw bytes and handles.
    fn decode_envelope(&mut self, offset: usize, ty: Option<&Type>, depth: usize) -> Result<Envelope> {
        let num_bytes = self.u32_at(offset)?;
        let num_handles = self.u32_at(offset + 4)?;
        match self.u64_at(offset + 8)? {
            ALLOC_ABSENT_U64 => {
                if num_bytes != 0 || num_handles != 0 {
                    return Err(Error::InvalidPresenceIndicator);
                }
                Ok(Envelope::Absent)
            }
            ALLOC_PRESENT_U64 => match ty {
                Some(ty) => {
                    let bytes_before = self.next_out_of_line;
                    let handles_before = self.handles.len();
                    let start = self.read_out_of_line(ty.inline_size(), depth)?;
                    let value = self.decode_value(ty, start, depth + 1)?;

                    let bytes_used = self.next_out_of_line - bytes_before;
                    if bytes_used != num_bytes as usize {
                        return Err(Error::EnvelopeBytesMismatch { declared: num_bytes, actual: bytes_used });
                    }
                    let handles_used = handles_before - self.handles.len();
                    if handles_used != num_handles as usize {
                        return Err(Error::EnvelopeHandlesMismatch { declared: num_handles, actual: handles_used });
                    }
                    Ok(Envelope::Known(value))
                }
                None => {
                    let len = num_bytes as usize;
                    if len % OBJECT_ALIGNMENT != 0 {
                        return Err(Error::EnvelopeBytesMismatch { declared: num_bytes, actual: round_up_to_align(len, OBJECT_ALIGNMENT) });
                    }
                    let start = self.read_out_of_line(len, depth)?;
                    let bytes = self.bytes_at(start, len)?.to_vec();
                    let mut handles = Vec::with_capacity(num_handles as usize);
                    for _ in 0..num_handles {
                        handles.push(self.take_handle()?);
                    }
                    Ok(Envelope::Unknown(bytes, handles))
                }
            },
            _ => Err(Error::InvalidPresenceIndicator),
        }
    }
}
