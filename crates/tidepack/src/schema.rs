//! # Schema
//!
//! Runtime type descriptors. A `Type` tells the encoder and decoder where
//! every byte of a value lives: its inline size and alignment, whether it has
//! an out-of-line part, and how unknown members are treated.
//!
//! Declarations (structs, unions, tables, enums) are shared behind `Arc` so a
//! protocol can hand the same schema to many messages without copying it.
//!
//! ## Invariants
//!
//! - Struct fields sit at natural alignment in declaration order; the struct
//!   size is rounded to its alignment. An empty struct is one byte.
//! - Union and table ordinals are nonzero and unique within a declaration.

use std::sync::Arc;

use crate::types::ENVELOPE_SIZE;
use crate::types::round_up_to_align;

/// Unsigned wire width of a bits or enum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    U8,
    U16,
    U32,
    U64,
}

impl Primitive {
    pub fn size(self) -> usize {
        match self {
            Primitive::U8 => 1,
            Primitive::U16 => 2,
            Primitive::U32 => 4,
            Primitive::U64 => 8,
        }
    }

    pub fn max_value(self) -> u64 {
        match self {
            Primitive::U8 => u8::MAX as u64,
            Primitive::U16 => u16::MAX as u64,
            Primitive::U32 => u32::MAX as u64,
            Primitive::U64 => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String { max_len: Option<u32>, nullable: bool },
    Vector { element: Box<Type>, max_len: Option<u32>, nullable: bool },
    Array { element: Box<Type>, len: usize },
    Handle { nullable: bool },
    Bits(BitsType),
    Enum(Arc<EnumType>),
    Struct(Arc<StructType>),
    /// An optional struct, stored out-of-line behind a presence marker.
    Boxed(Arc<StructType>),
    Union { decl: Arc<UnionType>, nullable: bool },
    Table(Arc<TableType>),
}

impl Type {
    pub fn string() -> Type {
        Type::String { max_len: None, nullable: false }
    }

    pub fn bounded_string(max_len: u32) -> Type {
        Type::String { max_len: Some(max_len), nullable: false }
    }

    pub fn vector(element: Type) -> Type {
        Type::Vector { element: Box::new(element), max_len: None, nullable: false }
    }

    pub fn bounded_vector(element: Type, max_len: u32) -> Type {
        Type::Vector { element: Box::new(element), max_len: Some(max_len), nullable: false }
    }

    pub fn bytes() -> Type {
        Type::vector(Type::U8)
    }

    pub fn array(element: Type, len: usize) -> Type {
        Type::Array { element: Box::new(element), len }
    }

    pub fn handle() -> Type {
        Type::Handle { nullable: false }
    }

    pub fn union(decl: Arc<UnionType>) -> Type {
        Type::Union { decl, nullable: false }
    }

    /// Makes a string, vector, handle, or union nullable, and boxes a struct.
    /// Other types are returned unchanged.
    pub fn nullable(self) -> Type {
        match self {
            Type::String { max_len, .. } => Type::String { max_len, nullable: true },
            Type::Vector { element, max_len, .. } => Type::Vector { element, max_len, nullable: true },
            Type::Handle { .. } => Type::Handle { nullable: true },
            Type::Union { decl, .. } => Type::Union { decl, nullable: true },
            Type::Struct(decl) => Type::Boxed(decl),
            other => other,
        }
    }

    /// The strict union used for fallible method results: ordinal 1 carries
    /// the success payload and ordinal 2 the domain error.
    pub fn result(ok: Type, err: Type) -> Type {
        Type::union(Arc::new(UnionType::strict(
            "Result",
            vec![Member::new(1, "response", ok), Member::new(2, "err", err)],
        )))
    }

    pub fn inline_size(&self) -> usize {
        match self {
            Type::Bool | Type::U8 | Type::I8 => 1,
            Type::U16 | Type::I16 => 2,
            Type::U32 | Type::I32 | Type::F32 => 4,
            Type::U64 | Type::I64 | Type::F64 => 8,
            Type::String { .. } | Type::Vector { .. } => 16,
            Type::Array { element, len } => element.inline_size() * len,
            Type::Handle { .. } => 4,
            Type::Bits(bits) => bits.primitive.size(),
            Type::Enum(decl) => decl.primitive.size(),
            Type::Struct(decl) => decl.size(),
            Type::Boxed(_) => 8,
            Type::Union { .. } => 8 + ENVELOPE_SIZE,
            Type::Table(_) => 16,
        }
    }

    pub fn inline_align(&self) -> usize {
        match self {
            Type::Bool | Type::U8 | Type::I8 => 1,
            Type::U16 | Type::I16 => 2,
            Type::U32 | Type::I32 | Type::F32 => 4,
            Type::U64 | Type::I64 | Type::F64 => 8,
            Type::String { .. } | Type::Vector { .. } => 8,
            Type::Array { element, .. } => element.inline_align(),
            Type::Handle { .. } => 4,
            Type::Bits(bits) => bits.primitive.size(),
            Type::Enum(decl) => decl.primitive.size(),
            Type::Struct(decl) => decl.align(),
            Type::Boxed(_) | Type::Union { .. } | Type::Table(_) => 8,
        }
    }

    pub fn is_nullable(&self) -> bool {
        match self {
            Type::String { nullable, .. }
            | Type::Vector { nullable, .. }
            | Type::Handle { nullable }
            | Type::Union { nullable, .. } => *nullable,
            Type::Boxed(_) => true,
            _ => false,
        }
    }

    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Type::Bool => "bool",
            Type::U8 => "u8",
            Type::U16 => "u16",
            Type::U32 => "u32",
            Type::U64 => "u64",
            Type::I8 => "i8",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::String { .. } => "string",
            Type::Vector { .. } => "vector",
            Type::Array { .. } => "array",
            Type::Handle { .. } => "handle",
            Type::Bits(_) => "bits",
            Type::Enum(_) => "enum",
            Type::Struct(_) | Type::Boxed(_) => "struct",
            Type::Union { .. } => "union",
            Type::Table(_) => "table",
        }
    }
}

/// A bit set; decoding clears any bit outside `mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitsType {
    pub primitive: Primitive,
    pub mask: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumType {
    pub name: String,
    pub primitive: Primitive,
    pub members: Vec<u64>,
    /// Strict enums reject values outside `members`; flexible ones keep them.
    pub strict: bool,
}

impl EnumType {
    pub fn is_member(&self, value: u64) -> bool {
        self.members.contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    name: String,
    fields: Vec<StructField>,
    size: usize,
    align: usize,
}

impl StructType {
    /// Lays out `fields` in declaration order at their natural alignment.
    pub fn new(name: impl Into<String>, fields: Vec<(&str, Type)>) -> Self {
        let mut laid_out = Vec::with_capacity(fields.len());
        let mut offset = 0;
        let mut align = 1;

        for (field_name, ty) in fields {
            let field_align = ty.inline_align();
            offset = round_up_to_align(offset, field_align);
            let size = ty.inline_size();
            laid_out.push(StructField { name: field_name.to_string(), ty, offset });
            offset += size;
            align = align.max(field_align);
        }

        let size = if laid_out.is_empty() { 1 } else { round_up_to_align(offset, align) };
        Self { name: name.into(), fields: laid_out, size, align }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A union variant or table field.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub ordinal: u64,
    pub name: String,
    pub ty: Type,
}

impl Member {
    pub fn new(ordinal: u64, name: &str, ty: Type) -> Self {
        debug_assert!(ordinal != 0, "member ordinals start at 1");
        Self { ordinal, name: name.to_string(), ty }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionType {
    pub name: String,
    pub members: Vec<Member>,
    /// Strict unions reject unknown ordinals; flexible ones keep them as raw data.
    pub strict: bool,
}

impl UnionType {
    pub fn strict(name: &str, members: Vec<Member>) -> Self {
        Self { name: name.to_string(), members, strict: true }
    }

    pub fn flexible(name: &str, members: Vec<Member>) -> Self {
        Self { name: name.to_string(), members, strict: false }
    }

    pub fn member(&self, ordinal: u64) -> Option<&Member> {
        self.members.iter().find(|m| m.ordinal == ordinal)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableType {
    pub name: String,
    pub members: Vec<Member>,
}

impl TableType {
    pub fn new(name: &str, members: Vec<Member>) -> Self {
        Self { name: name.to_string(), members }
    }

    pub fn member(&self, ordinal: u64) -> Option<&Member> {
        self.members.iter().find(|m| m.ordinal == ordinal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layout_natural_alignment() {
        let decl = StructType::new("S", vec![("a", Type::U8), ("b", Type::U32), ("c", Type::U16)]);
        let offsets: Vec<usize> = decl.fields().iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(decl.size(), 12);
        assert_eq!(decl.align(), 4);
    }

    #[test]
    fn test_empty_struct_is_one_byte() {
        let decl = StructType::empty("Empty");
        assert_eq!(decl.size(), 1);
        assert_eq!(decl.align(), 1);
    }

    #[test]
    fn test_inline_sizes() {
        assert_eq!(Type::string().inline_size(), 16);
        assert_eq!(Type::vector(Type::U32).inline_size(), 16);
        assert_eq!(Type::handle().inline_size(), 4);
        assert_eq!(Type::result(Type::U8, Type::I32).inline_size(), 24);
        assert_eq!(Type::array(Type::U16, 3).inline_size(), 6);
        assert_eq!(Type::Struct(Arc::new(StructType::empty("E"))).nullable().inline_size(), 8);
    }
}
