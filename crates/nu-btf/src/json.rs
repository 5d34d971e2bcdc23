//! JSON projection of a BTF graph
//!
//! Every record becomes one entry of `{"btf_kinds": [...]}` in id order. Entries
//! start with `id`, `kind_type` and `name`, followed by the kind's own fields.
//! Referenced ids are written next to a C-like spelling of the referenced type
//! (`const char *`, `struct task_struct`, `int[16]`, ...).

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::btf::Btf;
use crate::error::{FormatError, Result};
use crate::types::{BtfType, TypeId};
use crate::validate::Validator;

#[derive(Serialize)]
struct Document {
    btf_kinds: Vec<Entry>,
}

#[derive(Serialize)]
struct Entry {
    id: u32,
    kind_type: &'static str,
    name: String,
    #[serde(flatten)]
    detail: Detail,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Detail {
    Int {
        size_in_bytes: u32,
        offset_from_least_significant_bit: u8,
        field_width_in_bits: u8,
        is_signed: bool,
        is_char: bool,
        is_bool: bool,
    },
    Reference {
        type_id: u32,
        type_name: String,
    },
    Array {
        element_type_id: u32,
        element_type_name: String,
        index_type_id: u32,
        index_type_name: String,
        count_of_elements: u32,
    },
    Composite {
        size_in_bytes: u32,
        has_bitfields: bool,
        members: Vec<MemberEntry>,
    },
    Enum {
        size_in_bytes: u32,
        is_signed: bool,
        values: Vec<EnumValueEntry>,
    },
    Fwd {
        is_union: bool,
    },
    Linked {
        type_id: u32,
        type_name: String,
        linkage: &'static str,
    },
    FuncProto {
        return_type_id: u32,
        return_type_name: String,
        parameters: Vec<ParamEntry>,
    },
    DataSec {
        size_in_bytes: u32,
        members: Vec<DataSecEntry>,
    },
    Float {
        size_in_bytes: u32,
    },
    DeclTag {
        type_id: u32,
        type_name: String,
        component_index: i32,
    },
}

#[derive(Serialize)]
struct MemberEntry {
    name: String,
    type_id: u32,
    type_name: String,
    offset_from_start_in_bits: u32,
    size_in_bits: u32,
}

#[derive(Serialize)]
struct EnumValueEntry {
    name: String,
    value: EnumNumber,
}

#[derive(Serialize)]
#[serde(untagged)]
enum EnumNumber {
    Signed(i64),
    Unsigned(u64),
}

#[derive(Serialize)]
struct ParamEntry {
    name: String,
    type_id: u32,
    type_name: String,
}

#[derive(Serialize)]
struct DataSecEntry {
    type_id: u32,
    type_name: String,
    offset_in_bytes: u32,
    size_in_bytes: u32,
}

/// Builds C-like type spellings, memoizing every name it produces.
///
/// Names are composed bottom-up from an explicit work stack, so deep array,
/// pointer or prototype chains never grow the call stack. Reaching a record
/// that is still waiting for its dependencies means a structural loop with no
/// named composite to stop it.
struct NameResolver<'a> {
    btf: &'a Btf,
    cache: HashMap<TypeId, String>,
    on_path: HashSet<TypeId>,
}

impl<'a> NameResolver<'a> {
    fn new(btf: &'a Btf) -> Self {
        Self {
            btf,
            cache: HashMap::new(),
            on_path: HashSet::new(),
        }
    }

    /// Raw name of a string offset, empty when the offset is out of range
    fn raw(&self, offset: u32) -> String {
        self.btf
            .string_at(offset)
            .map(|s| s.into_owned())
            .unwrap_or_default()
    }

    /// Whether `id` can be spelled without further work
    fn is_spelled(&self, id: TypeId) -> bool {
        id.is_void() || self.cache.contains_key(&id) || !self.btf.contains(id)
    }

    fn spelled(&self, id: TypeId) -> &str {
        if id.is_void() {
            return "void";
        }
        self.cache.get(&id).map_or("<invalid>", String::as_str)
    }

    fn type_name(&mut self, id: TypeId) -> Result<String> {
        let btf = self.btf;
        // (record, dependencies pushed)
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if self.is_spelled(current) {
                continue;
            }
            let ty = btf.type_by_id(current)?;
            if expanded {
                let name = self.compose(ty);
                self.on_path.remove(&current);
                self.cache.insert(current, name);
                continue;
            }
            if !self.on_path.insert(current) {
                return Err(FormatError::CyclicType {
                    type_id: current,
                    cycles: 1,
                });
            }
            stack.push((current, true));
            for dependency in name_dependencies(ty).into_iter().rev() {
                if !self.is_spelled(dependency) {
                    stack.push((dependency, false));
                }
            }
        }
        Ok(self.spelled(id).to_string())
    }

    /// Spell a record whose dependencies are all spelled
    fn compose(&self, ty: &BtfType) -> String {
        match ty {
            BtfType::Ptr(r) => format!("{} *", self.spelled(r.type_id)),
            BtfType::Const(r) => format!("const {}", self.spelled(r.type_id)),
            BtfType::Volatile(r) => format!("volatile {}", self.spelled(r.type_id)),
            BtfType::Restrict(r) => format!("restrict {}", self.spelled(r.type_id)),
            BtfType::TypeTag(r) => self.spelled(r.type_id).to_string(),
            BtfType::Array(a) => format!("{}[{}]", self.spelled(a.element_type), a.len),
            BtfType::FuncProto(p) => {
                let params: Vec<&str> = p
                    .params
                    .iter()
                    .map(|param| {
                        if param.is_variadic() {
                            "..."
                        } else {
                            self.spelled(param.type_id)
                        }
                    })
                    .collect();
                format!("{} ({})", self.spelled(p.return_type), params.join(", "))
            }
            other => self.leaf_name(other),
        }
    }

    fn leaf_name(&self, ty: &BtfType) -> String {
        let tagged = |keyword: &str, offset: u32| {
            let name = self.raw(offset);
            if name.is_empty() {
                format!("{keyword} <anon>")
            } else {
                format!("{keyword} {name}")
            }
        };
        match ty {
            BtfType::Struct(c) => tagged("struct", c.name_offset),
            BtfType::Union(c) => tagged("union", c.name_offset),
            BtfType::Enum(e) => tagged("enum", e.name_offset),
            BtfType::Enum64(e) => tagged("enum", e.name_offset),
            BtfType::Fwd(f) if f.is_union => tagged("union", f.name_offset),
            BtfType::Fwd(f) => tagged("struct", f.name_offset),
            other => self.raw(other.name_offset()),
        }
    }
}

/// Records whose spelling is part of this record's spelling
fn name_dependencies(ty: &BtfType) -> Vec<TypeId> {
    match ty {
        BtfType::Ptr(r)
        | BtfType::Const(r)
        | BtfType::Volatile(r)
        | BtfType::Restrict(r)
        | BtfType::TypeTag(r) => vec![r.type_id],
        BtfType::Array(a) => vec![a.element_type],
        BtfType::FuncProto(p) => std::iter::once(p.return_type)
            .chain(
                p.params
                    .iter()
                    .filter(|param| !param.is_variadic())
                    .map(|param| param.type_id),
            )
            .collect(),
        _ => Vec::new(),
    }
}

fn entry(names: &mut NameResolver<'_>, id: TypeId, ty: &BtfType) -> Result<Entry> {
    let detail = match ty {
        BtfType::Int(t) => Detail::Int {
            size_in_bytes: t.size,
            offset_from_least_significant_bit: t.offset,
            field_width_in_bits: t.bits,
            is_signed: t.encoding.is_signed(),
            is_char: t.encoding.is_char(),
            is_bool: t.encoding.is_bool(),
        },
        BtfType::Ptr(r)
        | BtfType::Typedef(r)
        | BtfType::Volatile(r)
        | BtfType::Const(r)
        | BtfType::Restrict(r)
        | BtfType::TypeTag(r) => Detail::Reference {
            type_id: r.type_id.0,
            type_name: names.type_name(r.type_id)?,
        },
        BtfType::Array(a) => Detail::Array {
            element_type_id: a.element_type.0,
            element_type_name: names.type_name(a.element_type)?,
            index_type_id: a.index_type.0,
            index_type_name: names.type_name(a.index_type)?,
            count_of_elements: a.len,
        },
        BtfType::Struct(c) | BtfType::Union(c) => {
            let mut members = Vec::with_capacity(c.members.len());
            for member in &c.members {
                members.push(MemberEntry {
                    name: names.raw(member.name_offset),
                    type_id: member.type_id.0,
                    type_name: names.type_name(member.type_id)?,
                    offset_from_start_in_bits: member.bit_offset(c.kind_flag),
                    size_in_bits: member.bitfield_size(c.kind_flag),
                });
            }
            Detail::Composite {
                size_in_bytes: c.size,
                has_bitfields: c.kind_flag,
                members,
            }
        }
        BtfType::Enum(e) => Detail::Enum {
            size_in_bytes: e.size,
            is_signed: e.is_signed,
            values: e
                .values
                .iter()
                .map(|v| EnumValueEntry {
                    name: names.raw(v.name_offset),
                    value: if e.is_signed {
                        EnumNumber::Signed(i64::from(v.value as i32))
                    } else {
                        EnumNumber::Unsigned(u64::from(v.value))
                    },
                })
                .collect(),
        },
        BtfType::Enum64(e) => Detail::Enum {
            size_in_bytes: e.size,
            is_signed: e.is_signed,
            values: e
                .values
                .iter()
                .map(|v| EnumValueEntry {
                    name: names.raw(v.name_offset),
                    value: if e.is_signed {
                        EnumNumber::Signed(v.value as i64)
                    } else {
                        EnumNumber::Unsigned(v.value)
                    },
                })
                .collect(),
        },
        BtfType::Fwd(f) => Detail::Fwd {
            is_union: f.is_union,
        },
        BtfType::Func(f) => Detail::Linked {
            type_id: f.proto.0,
            type_name: names.type_name(f.proto)?,
            linkage: f.linkage.name(),
        },
        BtfType::FuncProto(p) => {
            let mut parameters = Vec::with_capacity(p.params.len());
            for param in &p.params {
                parameters.push(ParamEntry {
                    name: names.raw(param.name_offset),
                    type_id: param.type_id.0,
                    type_name: names.type_name(param.type_id)?,
                });
            }
            Detail::FuncProto {
                return_type_id: p.return_type.0,
                return_type_name: names.type_name(p.return_type)?,
                parameters,
            }
        }
        BtfType::Var(v) => Detail::Linked {
            type_id: v.type_id.0,
            type_name: names.type_name(v.type_id)?,
            linkage: v.linkage.name(),
        },
        BtfType::DataSec(d) => {
            let mut members = Vec::with_capacity(d.entries.len());
            for e in &d.entries {
                members.push(DataSecEntry {
                    type_id: e.type_id.0,
                    type_name: names.type_name(e.type_id)?,
                    offset_in_bytes: e.offset,
                    size_in_bytes: e.size,
                });
            }
            Detail::DataSec {
                size_in_bytes: d.size,
                members,
            }
        }
        BtfType::Float(f) => Detail::Float {
            size_in_bytes: f.size,
        },
        BtfType::DeclTag(t) => Detail::DeclTag {
            type_id: t.type_id.0,
            type_name: names.type_name(t.type_id)?,
            component_index: t.component_idx,
        },
    };

    Ok(Entry {
        id: id.0,
        kind_type: ty.kind().name(),
        name: names.raw(ty.name_offset()),
        detail,
    })
}

fn document(btf: &Btf, filter: impl Fn(TypeId) -> bool) -> Result<Document> {
    Validator::check_cycles(btf)?;
    let mut names = NameResolver::new(btf);
    let mut btf_kinds = Vec::new();
    for (id, ty) in btf.types() {
        if filter(id) {
            btf_kinds.push(entry(&mut names, id, ty)?);
        }
    }
    Ok(Document { btf_kinds })
}

/// Compact JSON for every record
pub fn to_json(btf: &Btf) -> Result<String> {
    to_json_filtered(btf, |_| true)
}

/// Compact JSON for the records whose id passes `filter`
pub fn to_json_filtered(btf: &Btf, filter: impl Fn(TypeId) -> bool) -> Result<String> {
    Ok(serde_json::to_string(&document(btf, filter)?)?)
}

/// Indented JSON for every record
pub fn to_json_pretty(btf: &Btf) -> Result<String> {
    Ok(serde_json::to_string_pretty(&document(btf, |_| true)?)?)
}

/// Re-indent JSON text, keeping key order
pub fn pretty_print_json(text: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(serde_json::to_string_pretty(&value)?)
}

impl Btf {
    pub fn to_json(&self) -> Result<String> {
        to_json(self)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        to_json_pretty(self)
    }

    /// C-like spelling of a type, as used by the JSON projection
    pub fn type_name(&self, id: TypeId) -> Result<String> {
        Validator::check_cycles(self)?;
        NameResolver::new(self).type_name(id)
    }
}
