//! BTF type records
//!
//! One record variant per BTF kind. Records refer to each other through
//! [`TypeId`] handles and to their names through offsets into the owning
//! graph's [`StringTable`](crate::StringTable).

use std::fmt;

use crate::error::Result;

/// Type identifier - the position of a record in the graph, 0 is `void`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub u32);

impl TypeId {
    /// The implicit `void` type
    pub const VOID: TypeId = TypeId(0);

    pub fn is_void(self) -> bool {
        self.0 == 0
    }

    /// Index of the record in the graph's record vector
    pub(crate) fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for TypeId {
    fn from(id: u32) -> Self {
        TypeId(id)
    }
}

/// BTF type kinds as encoded in bits 24-28 of a record's `info` word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BtfKind {
    Int = 1,
    Ptr = 2,
    Array = 3,
    Struct = 4,
    Union = 5,
    Enum = 6,
    Fwd = 7,
    Typedef = 8,
    Volatile = 9,
    Const = 10,
    Restrict = 11,
    Func = 12,
    FuncProto = 13,
    Var = 14,
    DataSec = 15,
    Float = 16,
    DeclTag = 17,
    TypeTag = 18,
    Enum64 = 19,
}

impl BtfKind {
    /// Name used by the JSON projection (`BTF_KIND_*`)
    pub fn name(self) -> &'static str {
        match self {
            BtfKind::Int => "BTF_KIND_INT",
            BtfKind::Ptr => "BTF_KIND_PTR",
            BtfKind::Array => "BTF_KIND_ARRAY",
            BtfKind::Struct => "BTF_KIND_STRUCT",
            BtfKind::Union => "BTF_KIND_UNION",
            BtfKind::Enum => "BTF_KIND_ENUM",
            BtfKind::Fwd => "BTF_KIND_FWD",
            BtfKind::Typedef => "BTF_KIND_TYPEDEF",
            BtfKind::Volatile => "BTF_KIND_VOLATILE",
            BtfKind::Const => "BTF_KIND_CONST",
            BtfKind::Restrict => "BTF_KIND_RESTRICT",
            BtfKind::Func => "BTF_KIND_FUNC",
            BtfKind::FuncProto => "BTF_KIND_FUNC_PROTO",
            BtfKind::Var => "BTF_KIND_VAR",
            BtfKind::DataSec => "BTF_KIND_DATASEC",
            BtfKind::Float => "BTF_KIND_FLOAT",
            BtfKind::DeclTag => "BTF_KIND_DECL_TAG",
            BtfKind::TypeTag => "BTF_KIND_TYPE_TAG",
            BtfKind::Enum64 => "BTF_KIND_ENUM64",
        }
    }
}

impl TryFrom<u32> for BtfKind {
    type Error = u32;

    fn try_from(kind: u32) -> std::result::Result<Self, u32> {
        Ok(match kind {
            1 => BtfKind::Int,
            2 => BtfKind::Ptr,
            3 => BtfKind::Array,
            4 => BtfKind::Struct,
            5 => BtfKind::Union,
            6 => BtfKind::Enum,
            7 => BtfKind::Fwd,
            8 => BtfKind::Typedef,
            9 => BtfKind::Volatile,
            10 => BtfKind::Const,
            11 => BtfKind::Restrict,
            12 => BtfKind::Func,
            13 => BtfKind::FuncProto,
            14 => BtfKind::Var,
            15 => BtfKind::DataSec,
            16 => BtfKind::Float,
            17 => BtfKind::DeclTag,
            18 => BtfKind::TypeTag,
            19 => BtfKind::Enum64,
            other => return Err(other),
        })
    }
}

impl fmt::Display for BtfKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer encoding flags (bits 24-27 of the INT payload word)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IntEncoding(pub u8);

impl IntEncoding {
    pub const NONE: IntEncoding = IntEncoding(0);
    pub const SIGNED: IntEncoding = IntEncoding(1 << 0);
    pub const CHAR: IntEncoding = IntEncoding(1 << 1);
    pub const BOOL: IntEncoding = IntEncoding(1 << 2);

    pub fn is_signed(self) -> bool {
        self.0 & Self::SIGNED.0 != 0
    }

    pub fn is_char(self) -> bool {
        self.0 & Self::CHAR.0 != 0
    }

    pub fn is_bool(self) -> bool {
        self.0 & Self::BOOL.0 != 0
    }
}

impl std::ops::BitOr for IntEncoding {
    type Output = IntEncoding;

    fn bitor(self, rhs: IntEncoding) -> IntEncoding {
        IntEncoding(self.0 | rhs.0)
    }
}

/// Linkage of a FUNC record, stored in the record's vlen field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FuncLinkage {
    Static = 0,
    Global = 1,
    Extern = 2,
}

impl FuncLinkage {
    pub fn name(self) -> &'static str {
        match self {
            FuncLinkage::Static => "static",
            FuncLinkage::Global => "global",
            FuncLinkage::Extern => "extern",
        }
    }
}

impl TryFrom<u32> for FuncLinkage {
    type Error = u32;

    fn try_from(linkage: u32) -> std::result::Result<Self, u32> {
        match linkage {
            0 => Ok(FuncLinkage::Static),
            1 => Ok(FuncLinkage::Global),
            2 => Ok(FuncLinkage::Extern),
            other => Err(other),
        }
    }
}

/// Linkage of a VAR record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VarLinkage {
    Static = 0,
    GlobalAllocated = 1,
    GlobalExtern = 2,
}

impl VarLinkage {
    pub fn name(self) -> &'static str {
        match self {
            VarLinkage::Static => "static",
            VarLinkage::GlobalAllocated => "global",
            VarLinkage::GlobalExtern => "extern",
        }
    }
}

impl TryFrom<u32> for VarLinkage {
    type Error = u32;

    fn try_from(linkage: u32) -> std::result::Result<Self, u32> {
        match linkage {
            0 => Ok(VarLinkage::Static),
            1 => Ok(VarLinkage::GlobalAllocated),
            2 => Ok(VarLinkage::GlobalExtern),
            other => Err(other),
        }
    }
}

/// INT record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Int {
    pub name_offset: u32,
    /// Size in bytes
    pub size: u32,
    pub encoding: IntEncoding,
    /// Bit offset from the least significant bit
    pub offset: u8,
    /// Width in bits
    pub bits: u8,
}

/// Record holding a single type reference: PTR, TYPEDEF, VOLATILE, CONST,
/// RESTRICT and TYPE_TAG all share this shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name_offset: u32,
    pub type_id: TypeId,
}

/// ARRAY record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Array {
    pub name_offset: u32,
    pub element_type: TypeId,
    pub index_type: TypeId,
    pub len: u32,
}

/// STRUCT or UNION member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name_offset: u32,
    pub type_id: TypeId,
    /// Raw offset word; its layout depends on the owner's `kind_flag`
    pub offset: u32,
}

impl Member {
    /// Offset of the member from the start of its composite, in bits
    pub fn bit_offset(&self, kind_flag: bool) -> u32 {
        if kind_flag {
            self.offset & 0x00ff_ffff
        } else {
            self.offset
        }
    }

    /// Bitfield width, 0 when the member is not a bitfield
    pub fn bitfield_size(&self, kind_flag: bool) -> u32 {
        if kind_flag { self.offset >> 24 } else { 0 }
    }
}

/// STRUCT or UNION record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composite {
    pub name_offset: u32,
    /// Size in bytes
    pub size: u32,
    /// Set when member offsets carry bitfield sizes in their upper 8 bits
    pub kind_flag: bool,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name_offset: u32,
    /// Raw 32-bit value, interpreted as signed when the enum is signed
    pub value: u32,
}

/// ENUM record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enum {
    pub name_offset: u32,
    pub size: u32,
    pub is_signed: bool,
    pub values: Vec<EnumValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enum64Value {
    pub name_offset: u32,
    /// Raw 64-bit value, interpreted as signed when the enum is signed
    pub value: u64,
}

/// ENUM64 record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enum64 {
    pub name_offset: u32,
    pub size: u32,
    pub is_signed: bool,
    pub values: Vec<Enum64Value>,
}

/// FWD record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fwd {
    pub name_offset: u32,
    pub is_union: bool,
}

/// FUNC record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Func {
    pub name_offset: u32,
    /// The FUNC_PROTO describing the signature
    pub proto: TypeId,
    pub linkage: FuncLinkage,
}

/// FUNC_PROTO parameter; a trailing parameter with no name and type 0 marks varargs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name_offset: u32,
    pub type_id: TypeId,
}

impl Param {
    pub fn is_variadic(&self) -> bool {
        self.name_offset == 0 && self.type_id.is_void()
    }
}

/// FUNC_PROTO record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncProto {
    pub name_offset: u32,
    pub return_type: TypeId,
    pub params: Vec<Param>,
}

/// VAR record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Var {
    pub name_offset: u32,
    pub type_id: TypeId,
    pub linkage: VarLinkage,
}

/// DATASEC entry: a variable placed in the section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSecEntry {
    pub type_id: TypeId,
    /// Offset in bytes within the section
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
}

/// DATASEC record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSec {
    pub name_offset: u32,
    pub size: u32,
    pub entries: Vec<DataSecEntry>,
}

/// FLOAT record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Float {
    pub name_offset: u32,
    pub size: u32,
}

/// DECL_TAG record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclTag {
    pub name_offset: u32,
    pub type_id: TypeId,
    /// Member or parameter index the tag applies to, -1 for the whole type
    pub component_idx: i32,
}

/// A single BTF type record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BtfType {
    Int(Int),
    Ptr(Reference),
    Array(Array),
    Struct(Composite),
    Union(Composite),
    Enum(Enum),
    Fwd(Fwd),
    Typedef(Reference),
    Volatile(Reference),
    Const(Reference),
    Restrict(Reference),
    Func(Func),
    FuncProto(FuncProto),
    Var(Var),
    DataSec(DataSec),
    Float(Float),
    DeclTag(DeclTag),
    TypeTag(Reference),
    Enum64(Enum64),
}

impl BtfType {
    pub fn kind(&self) -> BtfKind {
        match self {
            BtfType::Int(_) => BtfKind::Int,
            BtfType::Ptr(_) => BtfKind::Ptr,
            BtfType::Array(_) => BtfKind::Array,
            BtfType::Struct(_) => BtfKind::Struct,
            BtfType::Union(_) => BtfKind::Union,
            BtfType::Enum(_) => BtfKind::Enum,
            BtfType::Fwd(_) => BtfKind::Fwd,
            BtfType::Typedef(_) => BtfKind::Typedef,
            BtfType::Volatile(_) => BtfKind::Volatile,
            BtfType::Const(_) => BtfKind::Const,
            BtfType::Restrict(_) => BtfKind::Restrict,
            BtfType::Func(_) => BtfKind::Func,
            BtfType::FuncProto(_) => BtfKind::FuncProto,
            BtfType::Var(_) => BtfKind::Var,
            BtfType::DataSec(_) => BtfKind::DataSec,
            BtfType::Float(_) => BtfKind::Float,
            BtfType::DeclTag(_) => BtfKind::DeclTag,
            BtfType::TypeTag(_) => BtfKind::TypeTag,
            BtfType::Enum64(_) => BtfKind::Enum64,
        }
    }

    pub fn name_offset(&self) -> u32 {
        match self {
            BtfType::Int(t) => t.name_offset,
            BtfType::Ptr(t)
            | BtfType::Typedef(t)
            | BtfType::Volatile(t)
            | BtfType::Const(t)
            | BtfType::Restrict(t)
            | BtfType::TypeTag(t) => t.name_offset,
            BtfType::Array(t) => t.name_offset,
            BtfType::Struct(t) | BtfType::Union(t) => t.name_offset,
            BtfType::Enum(t) => t.name_offset,
            BtfType::Fwd(t) => t.name_offset,
            BtfType::Func(t) => t.name_offset,
            BtfType::FuncProto(t) => t.name_offset,
            BtfType::Var(t) => t.name_offset,
            BtfType::DataSec(t) => t.name_offset,
            BtfType::Float(t) => t.name_offset,
            BtfType::DeclTag(t) => t.name_offset,
            BtfType::Enum64(t) => t.name_offset,
        }
    }

    /// The single edge a consumer follows to reach the effective type.
    ///
    /// Only pointers, typedefs, qualifiers and type tags have one. Aggregate
    /// references (members, elements, parameters) are structural and may
    /// legitimately form cycles through a named composite.
    pub fn resolution_target(&self) -> Option<TypeId> {
        match self {
            BtfType::Ptr(r)
            | BtfType::Typedef(r)
            | BtfType::Volatile(r)
            | BtfType::Const(r)
            | BtfType::Restrict(r)
            | BtfType::TypeTag(r) => Some(r.type_id),
            _ => None,
        }
    }

    /// Every type id this record refers to, in wire order
    pub fn references(&self) -> Vec<TypeId> {
        match self {
            BtfType::Int(_) | BtfType::Fwd(_) | BtfType::Float(_) => Vec::new(),
            BtfType::Enum(_) | BtfType::Enum64(_) => Vec::new(),
            BtfType::Ptr(r)
            | BtfType::Typedef(r)
            | BtfType::Volatile(r)
            | BtfType::Const(r)
            | BtfType::Restrict(r)
            | BtfType::TypeTag(r) => vec![r.type_id],
            BtfType::Array(a) => vec![a.element_type, a.index_type],
            BtfType::Struct(c) | BtfType::Union(c) => {
                c.members.iter().map(|m| m.type_id).collect()
            }
            BtfType::Func(f) => vec![f.proto],
            BtfType::FuncProto(p) => std::iter::once(p.return_type)
                .chain(p.params.iter().map(|p| p.type_id))
                .collect(),
            BtfType::Var(v) => vec![v.type_id],
            BtfType::DataSec(d) => d.entries.iter().map(|e| e.type_id).collect(),
            BtfType::DeclTag(t) => vec![t.type_id],
        }
    }

    /// Number of trailing entries (members, values, parameters, variables)
    pub fn vlen(&self) -> usize {
        match self {
            BtfType::Struct(c) | BtfType::Union(c) => c.members.len(),
            BtfType::Enum(e) => e.values.len(),
            BtfType::Enum64(e) => e.values.len(),
            BtfType::FuncProto(p) => p.params.len(),
            BtfType::DataSec(d) => d.entries.len(),
            _ => 0,
        }
    }

    /// Size of the encoded record in bytes
    pub fn encoded_size(&self) -> usize {
        const COMMON: usize = 12;
        COMMON
            + match self {
                BtfType::Int(_) | BtfType::Var(_) | BtfType::DeclTag(_) => 4,
                BtfType::Array(_) => 12,
                BtfType::Struct(c) | BtfType::Union(c) => 12 * c.members.len(),
                BtfType::Enum(e) => 8 * e.values.len(),
                BtfType::Enum64(e) => 12 * e.values.len(),
                BtfType::FuncProto(p) => 8 * p.params.len(),
                BtfType::DataSec(d) => 12 * d.entries.len(),
                BtfType::Ptr(_)
                | BtfType::Typedef(_)
                | BtfType::Volatile(_)
                | BtfType::Const(_)
                | BtfType::Restrict(_)
                | BtfType::TypeTag(_)
                | BtfType::Fwd(_)
                | BtfType::Func(_)
                | BtfType::Float(_) => 0,
            }
    }

    /// Rewrite every name offset held by this record, including member names
    pub(crate) fn remap_name_offsets(
        &mut self,
        mut remap: impl FnMut(u32) -> Result<u32>,
    ) -> Result<()> {
        match self {
            BtfType::Int(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::Ptr(t)
            | BtfType::Typedef(t)
            | BtfType::Volatile(t)
            | BtfType::Const(t)
            | BtfType::Restrict(t)
            | BtfType::TypeTag(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::Array(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::Struct(t) | BtfType::Union(t) => {
                t.name_offset = remap(t.name_offset)?;
                for member in &mut t.members {
                    member.name_offset = remap(member.name_offset)?;
                }
            }
            BtfType::Enum(t) => {
                t.name_offset = remap(t.name_offset)?;
                for value in &mut t.values {
                    value.name_offset = remap(value.name_offset)?;
                }
            }
            BtfType::Enum64(t) => {
                t.name_offset = remap(t.name_offset)?;
                for value in &mut t.values {
                    value.name_offset = remap(value.name_offset)?;
                }
            }
            BtfType::Fwd(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::Func(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::FuncProto(t) => {
                t.name_offset = remap(t.name_offset)?;
                for param in &mut t.params {
                    param.name_offset = remap(param.name_offset)?;
                }
            }
            BtfType::Var(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::DataSec(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::Float(t) => t.name_offset = remap(t.name_offset)?,
            BtfType::DeclTag(t) => t.name_offset = remap(t.name_offset)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_raw_value() {
        for raw in 1..=19u32 {
            let kind = BtfKind::try_from(raw).unwrap();
            assert_eq!(kind as u32, raw);
        }
        assert_eq!(BtfKind::try_from(0), Err(0));
        assert_eq!(BtfKind::try_from(20), Err(20));
    }

    #[test]
    fn test_member_bitfield_layout() {
        let member = Member {
            name_offset: 0,
            type_id: TypeId(1),
            offset: (3 << 24) | 17,
        };
        assert_eq!(member.bit_offset(true), 17);
        assert_eq!(member.bitfield_size(true), 3);
        assert_eq!(member.bit_offset(false), (3 << 24) | 17);
        assert_eq!(member.bitfield_size(false), 0);
    }

    #[test]
    fn test_resolution_edges() {
        let ptr = BtfType::Ptr(Reference {
            name_offset: 0,
            type_id: TypeId(4),
        });
        assert_eq!(ptr.resolution_target(), Some(TypeId(4)));

        let array = BtfType::Array(Array {
            name_offset: 0,
            element_type: TypeId(1),
            index_type: TypeId(2),
            len: 8,
        });
        assert_eq!(array.resolution_target(), None);
        assert_eq!(array.references(), vec![TypeId(1), TypeId(2)]);
    }

    #[test]
    fn test_encoded_sizes() {
        let proto = BtfType::FuncProto(FuncProto {
            name_offset: 0,
            return_type: TypeId(1),
            params: vec![
                Param {
                    name_offset: 1,
                    type_id: TypeId(1),
                },
                Param {
                    name_offset: 0,
                    type_id: TypeId::VOID,
                },
            ],
        });
        assert_eq!(proto.encoded_size(), 12 + 16);
        assert_eq!(proto.vlen(), 2);
        assert!(matches!(&proto, BtfType::FuncProto(p) if p.params[1].is_variadic()));
    }
}
