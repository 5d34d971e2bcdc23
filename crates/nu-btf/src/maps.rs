//! BTF-defined maps
//!
//! libbpf describes maps declared in the `.maps` section through BTF alone.
//! Each map is a global variable of an anonymous struct whose members encode
//! the map attributes:
//! - `__uint(name, val)` becomes `int (*name)[val]`: a PTR to an ARRAY whose
//!   element count is the value
//! - `__type(key, T)` becomes `T *key`: the key size is the size of `T`
//! - `__array(values, struct inner)` becomes an ARRAY of pointers to the inner
//!   map's struct
//!
//! The section itself is a DATASEC named `.maps` listing the variables.

use log::debug;

use crate::btf::{Btf, POINTER_SIZE};
use crate::error::{FormatError, Result};
use crate::types::{BtfKind, BtfType, IntEncoding, TypeId, VarLinkage};

/// Name of the DATASEC holding map variables
pub const MAPS_SECTION: &str = ".maps";

/// A map declared through BTF
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BtfMapDefinition {
    pub name: String,
    /// The map's VAR record
    pub type_id: TypeId,
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub pinning: u32,
    /// Key type when declared with `__type(key, ...)`
    pub key_type_id: Option<TypeId>,
    /// Value type when declared with `__type(value, ...)`
    pub value_type_id: Option<TypeId>,
    /// Struct of the inner map for map-in-map declarations
    pub inner_map_type_id: Option<TypeId>,
}

impl BtfMapDefinition {
    pub fn new(name: impl Into<String>, map_type: u32) -> Self {
        Self {
            name: name.into(),
            map_type,
            ..Default::default()
        }
    }

    pub fn with_key_size(mut self, key_size: u32) -> Self {
        self.key_size = key_size;
        self
    }

    pub fn with_value_size(mut self, value_size: u32) -> Self {
        self.value_size = value_size;
        self
    }

    pub fn with_max_entries(mut self, max_entries: u32) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_map_flags(mut self, map_flags: u32) -> Self {
        self.map_flags = map_flags;
        self
    }

    pub fn with_pinning(mut self, pinning: u32) -> Self {
        self.pinning = pinning;
        self
    }

    pub fn with_key_type(mut self, key_type_id: TypeId) -> Self {
        self.key_type_id = Some(key_type_id);
        self
    }

    pub fn with_value_type(mut self, value_type_id: TypeId) -> Self {
        self.value_type_id = Some(value_type_id);
        self
    }

    pub fn with_inner_map(mut self, inner_map_type_id: TypeId) -> Self {
        self.inner_map_type_id = Some(inner_map_type_id);
        self
    }
}

/// Read every map declared in the `.maps` DATASEC; no section means no maps
pub fn parse_btf_map_section(btf: &Btf) -> Result<Vec<BtfMapDefinition>> {
    let section = match btf.type_id_by_name_kind(MAPS_SECTION, BtfKind::DataSec) {
        Ok(id) => id,
        Err(FormatError::UnknownTypeName(_)) => {
            debug!("No {MAPS_SECTION} section in BTF");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let BtfType::DataSec(datasec) = btf.type_by_id(section)? else {
        return Err(FormatError::UnexpectedType {
            type_id: section,
            expected: "datasec",
        });
    };

    datasec
        .entries
        .iter()
        .map(|entry| parse_btf_map_def(btf, entry.type_id))
        .collect()
}

fn parse_btf_map_def(btf: &Btf, var_id: TypeId) -> Result<BtfMapDefinition> {
    let BtfType::Var(var) = btf.type_by_id(var_id)? else {
        return Err(FormatError::UnexpectedType {
            type_id: var_id,
            expected: "map variable",
        });
    };
    let mut def = BtfMapDefinition {
        name: btf.string_at(var.name_offset)?.into_owned(),
        type_id: var_id,
        ..Default::default()
    };

    let root = btf.resolve_type(var.type_id)?;
    let BtfType::Struct(layout) = btf.type_by_id(root)? else {
        return Err(FormatError::UnexpectedType {
            type_id: root,
            expected: "map struct",
        });
    };

    for member in &layout.members {
        let member_name = btf.string_at(member.name_offset)?;
        match member_name.as_ref() {
            "type" => def.map_type = uint_field(btf, member.type_id)?,
            "key_size" => def.key_size = uint_field(btf, member.type_id)?,
            "value_size" => def.value_size = uint_field(btf, member.type_id)?,
            "max_entries" => def.max_entries = uint_field(btf, member.type_id)?,
            "map_flags" => def.map_flags = uint_field(btf, member.type_id)?,
            "pinning" => def.pinning = uint_field(btf, member.type_id)?,
            "key" => {
                let key = btf.dereference_pointer(member.type_id)?;
                def.key_size = sized(btf, key)?;
                def.key_type_id = Some(key);
            }
            "value" => {
                let value = btf.dereference_pointer(member.type_id)?;
                def.value_size = sized(btf, value)?;
                def.value_type_id = Some(value);
            }
            "values" => {
                let BtfType::Array(array) = btf.type_by_id(member.type_id)? else {
                    return Err(FormatError::UnexpectedType {
                        type_id: member.type_id,
                        expected: "array of inner map pointers",
                    });
                };
                let inner = btf.dereference_pointer(array.element_type)?;
                def.inner_map_type_id = Some(btf.resolve_type(inner)?);
                if def.value_size == 0 {
                    // map-in-map values are file descriptors
                    def.value_size = 4;
                }
            }
            other => {
                debug!("Skipping unknown member '{other}' of map '{}'", def.name);
            }
        }
    }

    debug!(
        "Parsed BTF map '{}': type={} key_size={} value_size={} max_entries={}",
        def.name, def.map_type, def.key_size, def.value_size, def.max_entries
    );
    Ok(def)
}

/// Value of an `int (*name)[val]` member
fn uint_field(btf: &Btf, member_type: TypeId) -> Result<u32> {
    let target = btf.dereference_pointer(member_type)?;
    match btf.type_by_id(target)? {
        BtfType::Array(array) => Ok(array.len),
        _ => Err(FormatError::UnexpectedType {
            type_id: target,
            expected: "__uint array",
        }),
    }
}

fn sized(btf: &Btf, id: TypeId) -> Result<u32> {
    let size = btf.type_size(id)?;
    u32::try_from(size).map_err(|_| FormatError::UnexpectedType {
        type_id: id,
        expected: "type smaller than 4 GiB",
    })
}

/// `int (*)[value]`
fn add_uint_type(btf: &mut Btf, int_type: TypeId, value: u32) -> TypeId {
    let array = btf.add_array(int_type, int_type, value);
    btf.add_ptr(array)
}

/// Append the records describing `maps` and a `.maps` DATASEC listing them.
///
/// Each map struct has pointer-sized members, so a map with the usual five
/// attributes takes 40 bytes of the section. Returns the DATASEC id, and the
/// `type_id` of each definition is the VAR appended for it, in order.
pub fn build_btf_map_section(maps: &[BtfMapDefinition], btf: &mut Btf) -> (TypeId, Vec<TypeId>) {
    let int_type = btf.add_int("int", 4, IntEncoding::SIGNED);

    let mut vars = Vec::with_capacity(maps.len());
    let mut entries = Vec::with_capacity(maps.len());
    let mut offset = 0u32;

    for map in maps {
        let mut members: Vec<(&str, TypeId)> = Vec::new();
        members.push(("type", add_uint_type(btf, int_type, map.map_type)));
        match map.key_type_id {
            Some(key) => members.push(("key", btf.add_ptr(key))),
            None => members.push(("key_size", add_uint_type(btf, int_type, map.key_size))),
        }
        match map.value_type_id {
            Some(value) => members.push(("value", btf.add_ptr(value))),
            None if map.inner_map_type_id.is_some() => {}
            None => members.push(("value_size", add_uint_type(btf, int_type, map.value_size))),
        }
        members.push((
            "max_entries",
            add_uint_type(btf, int_type, map.max_entries),
        ));
        if map.map_flags != 0 {
            members.push(("map_flags", add_uint_type(btf, int_type, map.map_flags)));
        }
        members.push(("pinning", add_uint_type(btf, int_type, map.pinning)));
        if let Some(inner) = map.inner_map_type_id {
            let inner_ptr = btf.add_ptr(inner);
            members.push(("values", btf.add_array(inner_ptr, int_type, 0)));
        }

        let size = (members.len() as u64 * POINTER_SIZE) as u32;
        let layout: Vec<(&str, TypeId, u32)> = members
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| (*name, *ty, i as u32 * POINTER_SIZE as u32 * 8))
            .collect();
        let struct_type = btf.add_struct("", size, &layout);
        let var = btf.add_var(&map.name, struct_type, VarLinkage::GlobalAllocated);

        debug!("Added BTF map '{}' as {var} ({size} bytes)", map.name);
        vars.push(var);
        entries.push((var, offset, size));
        offset += size;
    }

    let datasec = btf.add_datasec(MAPS_SECTION, &entries);
    (datasec, vars)
}
