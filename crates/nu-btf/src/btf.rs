//! The BTF type graph
//!
//! [`Btf`] owns an ordered list of type records and the string table their
//! names live in. Records are addressed by [`TypeId`]: the Nth appended record
//! gets id N, id 0 is the implicit `void`.
//!
//! Graphs come either from [`Btf::from_bytes`] or from the append API below.
//! Appending never validates; [`Btf::validate`] and the encoder do.

use std::borrow::Cow;
use std::collections::HashSet;

use object::Endianness;

use crate::error::{FormatError, Result};
use crate::strings::StringTable;
use crate::types::{
    Array, BtfKind, BtfType, Composite, DataSec, DataSecEntry, DeclTag, Enum, Enum64,
    Enum64Value, EnumValue, Float, Func, FuncLinkage, FuncProto, Fwd, Int, IntEncoding, Member,
    Param, Reference, TypeId, Var, VarLinkage,
};
use crate::validate::Validator;

/// Size of a pointer on the BPF target
pub const POINTER_SIZE: u64 = 8;

/// An in-memory BTF type section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Btf {
    types: Vec<BtfType>,
    strings: StringTable,
    endianness: Endianness,
}

impl Btf {
    /// Create an empty graph with a string table holding only ""
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            strings: StringTable::new(),
            endianness: Endianness::Little,
        }
    }

    pub(crate) fn from_parts(
        types: Vec<BtfType>,
        strings: StringTable,
        endianness: Endianness,
    ) -> Self {
        Self {
            types,
            strings,
            endianness,
        }
    }

    /// Byte order the graph was decoded from (little-endian for built graphs)
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// Number of records, not counting `void`
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Records in id order, paired with their ids
    pub fn types(&self) -> impl Iterator<Item = (TypeId, &BtfType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, ty)| (TypeId(i as u32 + 1), ty))
    }

    /// Highest id currently assigned
    pub fn last_type_id(&self) -> TypeId {
        TypeId(self.types.len() as u32)
    }

    /// Whether `id` is `void` or names an existing record
    pub fn contains(&self, id: TypeId) -> bool {
        id.0 as usize <= self.types.len()
    }

    /// Intern a string in the graph's string table
    pub fn add_string(&mut self, s: &str) -> u32 {
        self.strings.add(s)
    }

    pub fn string_at(&self, offset: u32) -> Result<Cow<'_, str>> {
        self.strings.get(offset)
    }

    /// Append a record and return its id. References are not checked here.
    pub fn append(&mut self, ty: BtfType) -> TypeId {
        self.types.push(ty);
        TypeId(self.types.len() as u32)
    }

    pub fn type_by_id(&self, id: TypeId) -> Result<&BtfType> {
        id.index()
            .and_then(|i| self.types.get(i))
            .ok_or(FormatError::UnknownTypeId(id))
    }

    /// Raw name of a record, "" for anonymous ones
    pub fn name_of(&self, id: TypeId) -> Result<Cow<'_, str>> {
        let ty = self.type_by_id(id)?;
        self.strings.get(ty.name_offset())
    }

    /// Id of the first record carrying `name`
    pub fn type_id_by_name(&self, name: &str) -> Result<TypeId> {
        self.find_by_name(name, None)
    }

    /// Id of the first record of `kind` carrying `name`
    pub fn type_id_by_name_kind(&self, name: &str, kind: BtfKind) -> Result<TypeId> {
        self.find_by_name(name, Some(kind))
    }

    fn find_by_name(&self, name: &str, kind: Option<BtfKind>) -> Result<TypeId> {
        for (id, ty) in self.types() {
            if kind.is_some_and(|k| k != ty.kind()) || ty.name_offset() == 0 {
                continue;
            }
            if self.strings.get(ty.name_offset()).is_ok_and(|n| n == name) {
                return Ok(id);
            }
        }
        Err(FormatError::UnknownTypeName(name.to_string()))
    }

    /// Strip typedefs, qualifiers and type tags to reach the effective type
    pub fn resolve_type(&self, id: TypeId) -> Result<TypeId> {
        let mut seen = HashSet::new();
        let mut current = id;
        while !current.is_void() {
            if !seen.insert(current) {
                return Err(FormatError::CyclicType {
                    type_id: current,
                    cycles: 1,
                });
            }
            match self.type_by_id(current)? {
                BtfType::Typedef(r)
                | BtfType::Volatile(r)
                | BtfType::Const(r)
                | BtfType::Restrict(r)
                | BtfType::TypeTag(r) => current = r.type_id,
                _ => break,
            }
        }
        Ok(current)
    }

    /// Target of a PTR record
    pub fn dereference_pointer(&self, id: TypeId) -> Result<TypeId> {
        match self.type_by_id(id)? {
            BtfType::Ptr(r) => Ok(r.type_id),
            _ => Err(FormatError::UnexpectedType {
                type_id: id,
                expected: "pointer",
            }),
        }
    }

    /// Size in bytes of a value of type `id`
    pub fn type_size(&self, id: TypeId) -> Result<u64> {
        let mut seen = HashSet::new();
        let mut current = id;
        let mut multiplier: u64 = 1;
        loop {
            if !seen.insert(current) {
                return Err(FormatError::CyclicType {
                    type_id: current,
                    cycles: 1,
                });
            }
            let ty = self.type_by_id(current).map_err(|_| {
                if current.is_void() {
                    FormatError::UnexpectedType {
                        type_id: current,
                        expected: "sized type",
                    }
                } else {
                    FormatError::UnknownTypeId(current)
                }
            })?;
            let size = match ty {
                BtfType::Int(t) => u64::from(t.size),
                BtfType::Float(t) => u64::from(t.size),
                BtfType::Struct(c) | BtfType::Union(c) => u64::from(c.size),
                BtfType::Enum(e) => u64::from(e.size),
                BtfType::Enum64(e) => u64::from(e.size),
                BtfType::DataSec(d) => u64::from(d.size),
                BtfType::Ptr(_) => POINTER_SIZE,
                BtfType::Array(a) => {
                    multiplier = multiplier.checked_mul(u64::from(a.len)).ok_or(
                        FormatError::UnexpectedType {
                            type_id: current,
                            expected: "array with representable size",
                        },
                    )?;
                    current = a.element_type;
                    continue;
                }
                BtfType::Typedef(r)
                | BtfType::Volatile(r)
                | BtfType::Const(r)
                | BtfType::Restrict(r)
                | BtfType::TypeTag(r) => {
                    current = r.type_id;
                    continue;
                }
                BtfType::Var(v) => {
                    current = v.type_id;
                    continue;
                }
                BtfType::Func(_)
                | BtfType::FuncProto(_)
                | BtfType::Fwd(_)
                | BtfType::DeclTag(_) => {
                    return Err(FormatError::UnexpectedType {
                        type_id: current,
                        expected: "sized type",
                    });
                }
            };
            return size.checked_mul(multiplier).ok_or(FormatError::UnexpectedType {
                type_id: id,
                expected: "type with representable size",
            });
        }
    }

    /// Visit every record reachable from `root`, children before parents.
    ///
    /// Each record is visited once, so structural cycles are fine. Returns the
    /// visit order.
    pub fn visit_depth_first(
        &self,
        root: TypeId,
        mut visitor: impl FnMut(TypeId, &BtfType),
    ) -> Result<Vec<TypeId>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        // (id, children pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if id.is_void() {
                continue;
            }
            let ty = self.type_by_id(id)?;
            if expanded {
                visitor(id, ty);
                order.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            for child in ty.references().into_iter().rev() {
                if !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
        }
        Ok(order)
    }

    /// Replace the record at `id`, keeping the graph free of resolution cycles.
    ///
    /// On failure the previous record is restored and the error returned.
    pub fn replace(&mut self, id: TypeId, ty: BtfType) -> Result<BtfType> {
        let index = id
            .index()
            .filter(|i| *i < self.types.len())
            .ok_or(FormatError::UnknownTypeId(id))?;
        let previous = std::mem::replace(&mut self.types[index], ty);
        if let Err(e) = Validator::check_cycles(self) {
            self.types[index] = previous;
            return Err(e);
        }
        Ok(previous)
    }

    /// Check references and resolution cycles
    pub fn validate(&self) -> Result<()> {
        Validator::validate(self)
    }

    pub fn add_int(&mut self, name: &str, size: u32, encoding: IntEncoding) -> TypeId {
        let name_offset = self.add_string(name);
        self.append(BtfType::Int(Int {
            name_offset,
            size,
            encoding,
            offset: 0,
            bits: size.saturating_mul(8).min(u32::from(u8::MAX)) as u8,
        }))
    }

    pub fn add_ptr(&mut self, target: TypeId) -> TypeId {
        self.append(BtfType::Ptr(Reference {
            name_offset: 0,
            type_id: target,
        }))
    }

    pub fn add_array(&mut self, element_type: TypeId, index_type: TypeId, len: u32) -> TypeId {
        self.append(BtfType::Array(Array {
            name_offset: 0,
            element_type,
            index_type,
            len,
        }))
    }

    /// Add a struct; members are (name, type, bit offset)
    pub fn add_struct(&mut self, name: &str, size: u32, members: &[(&str, TypeId, u32)]) -> TypeId {
        let composite = self.composite(name, size, members);
        self.append(BtfType::Struct(composite))
    }

    /// Add a union; members are (name, type, bit offset)
    pub fn add_union(&mut self, name: &str, size: u32, members: &[(&str, TypeId, u32)]) -> TypeId {
        let composite = self.composite(name, size, members);
        self.append(BtfType::Union(composite))
    }

    fn composite(&mut self, name: &str, size: u32, members: &[(&str, TypeId, u32)]) -> Composite {
        let name_offset = self.add_string(name);
        let members = members
            .iter()
            .map(|(member_name, type_id, bit_offset)| Member {
                name_offset: self.add_string(member_name),
                type_id: *type_id,
                offset: *bit_offset,
            })
            .collect();
        Composite {
            name_offset,
            size,
            kind_flag: false,
            members,
        }
    }

    pub fn add_enum(
        &mut self,
        name: &str,
        size: u32,
        is_signed: bool,
        values: &[(&str, i64)],
    ) -> TypeId {
        let name_offset = self.add_string(name);
        let values = values
            .iter()
            .map(|(value_name, value)| EnumValue {
                name_offset: self.add_string(value_name),
                value: *value as u32,
            })
            .collect();
        self.append(BtfType::Enum(Enum {
            name_offset,
            size,
            is_signed,
            values,
        }))
    }

    pub fn add_enum64(
        &mut self,
        name: &str,
        size: u32,
        is_signed: bool,
        values: &[(&str, i64)],
    ) -> TypeId {
        let name_offset = self.add_string(name);
        let values = values
            .iter()
            .map(|(value_name, value)| Enum64Value {
                name_offset: self.add_string(value_name),
                value: *value as u64,
            })
            .collect();
        self.append(BtfType::Enum64(Enum64 {
            name_offset,
            size,
            is_signed,
            values,
        }))
    }

    pub fn add_fwd(&mut self, name: &str, is_union: bool) -> TypeId {
        let name_offset = self.add_string(name);
        self.append(BtfType::Fwd(Fwd {
            name_offset,
            is_union,
        }))
    }

    pub fn add_typedef(&mut self, name: &str, target: TypeId) -> TypeId {
        let name_offset = self.add_string(name);
        self.append(BtfType::Typedef(Reference {
            name_offset,
            type_id: target,
        }))
    }

    pub fn add_volatile(&mut self, target: TypeId) -> TypeId {
        self.append(BtfType::Volatile(Reference {
            name_offset: 0,
            type_id: target,
        }))
    }

    pub fn add_const(&mut self, target: TypeId) -> TypeId {
        self.append(BtfType::Const(Reference {
            name_offset: 0,
            type_id: target,
        }))
    }

    pub fn add_restrict(&mut self, target: TypeId) -> TypeId {
        self.append(BtfType::Restrict(Reference {
            name_offset: 0,
            type_id: target,
        }))
    }

    pub fn add_func(&mut self, name: &str, proto: TypeId, linkage: FuncLinkage) -> TypeId {
        let name_offset = self.add_string(name);
        self.append(BtfType::Func(Func {
            name_offset,
            proto,
            linkage,
        }))
    }

    /// Add a function prototype; params are (name, type)
    pub fn add_func_proto(&mut self, return_type: TypeId, params: &[(&str, TypeId)]) -> TypeId {
        let params = params
            .iter()
            .map(|(param_name, type_id)| Param {
                name_offset: self.add_string(param_name),
                type_id: *type_id,
            })
            .collect();
        self.append(BtfType::FuncProto(FuncProto {
            name_offset: 0,
            return_type,
            params,
        }))
    }

    pub fn add_var(&mut self, name: &str, type_id: TypeId, linkage: VarLinkage) -> TypeId {
        let name_offset = self.add_string(name);
        self.append(BtfType::Var(Var {
            name_offset,
            type_id,
            linkage,
        }))
    }

    /// Add a data section; entries are (variable, byte offset, byte size)
    pub fn add_datasec(&mut self, name: &str, entries: &[(TypeId, u32, u32)]) -> TypeId {
        let name_offset = self.add_string(name);
        let size = entries
            .iter()
            .map(|(_, offset, size)| offset.saturating_add(*size))
            .max()
            .unwrap_or(0);
        let entries = entries
            .iter()
            .map(|(type_id, offset, size)| DataSecEntry {
                type_id: *type_id,
                offset: *offset,
                size: *size,
            })
            .collect();
        self.append(BtfType::DataSec(DataSec {
            name_offset,
            size,
            entries,
        }))
    }

    pub fn add_float(&mut self, name: &str, size: u32) -> TypeId {
        let name_offset = self.add_string(name);
        self.append(BtfType::Float(Float { name_offset, size }))
    }

    pub fn add_decl_tag(&mut self, tag: &str, target: TypeId, component_idx: i32) -> TypeId {
        let name_offset = self.add_string(tag);
        self.append(BtfType::DeclTag(DeclTag {
            name_offset,
            type_id: target,
            component_idx,
        }))
    }

    pub fn add_type_tag(&mut self, tag: &str, target: TypeId) -> TypeId {
        let name_offset = self.add_string(tag);
        self.append(BtfType::TypeTag(Reference {
            name_offset,
            type_id: target,
        }))
    }
}

impl Default for Btf {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Btf, TypeId, TypeId, TypeId) {
        let mut btf = Btf::new();
        let int = btf.add_int("int", 4, IntEncoding::SIGNED);
        let array = btf.add_array(int, int, 16);
        let node = btf.add_struct("node", 16, &[("value", int, 0), ("next", TypeId(4), 64)]);
        btf.add_ptr(node);
        (btf, int, array, node)
    }

    #[test]
    fn test_append_assigns_sequential_ids() {
        let mut btf = Btf::new();
        assert_eq!(btf.add_ptr(TypeId(2)), TypeId(1));
        assert_eq!(btf.add_int("int", 4, IntEncoding::SIGNED), TypeId(2));
        assert_eq!(btf.len(), 2);
        assert_eq!(btf.last_type_id(), TypeId(2));
    }

    #[test]
    fn test_add_int_caps_bit_width() {
        let mut btf = Btf::new();
        let wide = btf.add_int("__int128", 16, IntEncoding::SIGNED);
        let huge = btf.add_int("huge", u32::MAX, IntEncoding::NONE);
        let byte = btf.add_int("u8", 1, IntEncoding::NONE);
        let bits = |id| match btf.type_by_id(id).unwrap() {
            BtfType::Int(int) => int.bits,
            other => panic!("expected an int, got {other:?}"),
        };
        assert_eq!(bits(wide), 128);
        assert_eq!(bits(huge), u8::MAX);
        assert_eq!(bits(byte), 8);
    }

    #[test]
    fn test_lookup_by_name() {
        let (btf, int, _, node) = sample();
        assert_eq!(btf.type_id_by_name("int").unwrap(), int);
        assert_eq!(
            btf.type_id_by_name_kind("node", BtfKind::Struct).unwrap(),
            node
        );
        assert!(matches!(
            btf.type_id_by_name_kind("node", BtfKind::Union),
            Err(FormatError::UnknownTypeName(_))
        ));
        assert_eq!(btf.name_of(node).unwrap(), "node");
    }

    #[test]
    fn test_type_size() {
        let (mut btf, int, array, node) = sample();
        assert_eq!(btf.type_size(int).unwrap(), 4);
        assert_eq!(btf.type_size(array).unwrap(), 64);
        assert_eq!(btf.type_size(node).unwrap(), 16);
        assert_eq!(btf.type_size(TypeId(4)).unwrap(), POINTER_SIZE);

        let typedef = btf.add_typedef("int_array", array);
        let konst = btf.add_const(typedef);
        assert_eq!(btf.type_size(konst).unwrap(), 64);

        assert!(btf.type_size(TypeId::VOID).is_err());
    }

    #[test]
    fn test_resolve_and_dereference() {
        let (mut btf, int, _, node) = sample();
        let typedef = btf.add_typedef("node_t", node);
        let volatile = btf.add_volatile(typedef);
        assert_eq!(btf.resolve_type(volatile).unwrap(), node);
        assert_eq!(btf.resolve_type(int).unwrap(), int);
        assert_eq!(btf.dereference_pointer(TypeId(4)).unwrap(), node);
        assert!(matches!(
            btf.dereference_pointer(int),
            Err(FormatError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn test_resolve_detects_typedef_loop() {
        let mut btf = Btf::new();
        btf.add_typedef("a", TypeId(2));
        btf.add_typedef("b", TypeId(1));
        assert!(matches!(
            btf.resolve_type(TypeId(1)),
            Err(FormatError::CyclicType { .. })
        ));
        assert!(matches!(
            btf.type_size(TypeId(1)),
            Err(FormatError::CyclicType { .. })
        ));
    }

    #[test]
    fn test_visit_depth_first_handles_self_reference() {
        let (btf, int, _, node) = sample();
        let mut visited = Vec::new();
        let order = btf
            .visit_depth_first(node, |id, _| visited.push(id))
            .unwrap();
        assert_eq!(order, visited);
        assert_eq!(order, vec![int, TypeId(4), node]);
    }

    #[test]
    fn test_replace_rolls_back_on_cycle() {
        let (mut btf, int, _, _) = sample();
        let ptr = btf.add_ptr(int);
        let err = btf
            .replace(
                ptr,
                BtfType::Ptr(Reference {
                    name_offset: 0,
                    type_id: ptr,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, FormatError::CyclicType { type_id, .. } if type_id == ptr));
        assert_eq!(btf.dereference_pointer(ptr).unwrap(), int);

        let previous = btf
            .replace(
                ptr,
                BtfType::Ptr(Reference {
                    name_offset: 0,
                    type_id: TypeId(3),
                }),
            )
            .unwrap();
        assert_eq!(previous.references(), vec![int]);
        assert_eq!(btf.dereference_pointer(ptr).unwrap(), TypeId(3));
    }

    #[test]
    fn test_datasec_size_covers_entries() {
        let mut btf = Btf::new();
        let int = btf.add_int("int", 4, IntEncoding::SIGNED);
        let a = btf.add_var("a", int, VarLinkage::GlobalAllocated);
        let b = btf.add_var("b", int, VarLinkage::Static);
        let sec = btf.add_datasec(".data", &[(a, 0, 4), (b, 8, 4)]);
        assert_eq!(btf.type_size(sec).unwrap(), 12);
        assert_eq!(btf.type_size(a).unwrap(), 4);
    }
}
