//! BTF encoding
//!
//! Writes a graph back into the `.BTF` layout read by [`crate::decode`]:
//! header, type section, string section. The graph is validated first, so a
//! graph with a resolution cycle or a dangling reference never produces bytes.

use log::debug;
use object::endian::{Endian, Endianness};

use crate::btf::Btf;
use crate::decode::{BTF_HEADER_LEN, BTF_MAGIC, BTF_VERSION};
use crate::error::{FormatError, Result};
use crate::strings::StringTable;
use crate::types::{BtfType, TypeId};
use crate::validate::Validator;

/// Largest count a record's 16-bit vlen field can hold
const MAX_VLEN: usize = 0xffff;

/// How the string section is written
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StringMode {
    /// Emit the graph's string table as is
    #[default]
    Preserve,
    /// Emit only the names records refer to, deduplicated, and rewrite offsets
    Compact,
}

/// Options for [`Btf::to_bytes_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub endianness: Endianness,
    pub string_mode: StringMode,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            endianness: Endianness::Little,
            string_mode: StringMode::Preserve,
        }
    }
}

impl EncodeOptions {
    /// Defaults, but in the byte order `btf` was decoded from
    pub fn for_btf(btf: &Btf) -> Self {
        Self::default().with_endianness(btf.endianness())
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn with_string_mode(mut self, string_mode: StringMode) -> Self {
        self.string_mode = string_mode;
        self
    }
}

struct Writer {
    buf: Vec<u8>,
    endian: Endianness,
}

impl Writer {
    fn new(endian: Endianness, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            endian,
        }
    }

    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&self.endian.write_u16_bytes(value));
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&self.endian.write_u32_bytes(value));
    }

    fn type_id(&mut self, id: TypeId) {
        self.u32(id.0);
    }
}

/// Encode a graph, validating it first
pub fn encode(btf: &Btf, options: &EncodeOptions) -> Result<Vec<u8>> {
    Validator::validate(btf)?;

    let compacted;
    let (types, strings): (Vec<&BtfType>, &StringTable) = match options.string_mode {
        StringMode::Preserve => (btf.types().map(|(_, ty)| ty).collect(), btf.strings()),
        StringMode::Compact => {
            compacted = compact(btf)?;
            (compacted.0.iter().collect(), &compacted.1)
        }
    };

    let type_len: usize = types.iter().map(|ty| ty.encoded_size()).sum();
    let mut type_section = Writer::new(options.endianness, type_len);
    for (index, ty) in types.iter().enumerate() {
        encode_type(&mut type_section, ty, TypeId(index as u32 + 1))?;
    }

    let str_bytes = strings.as_bytes();
    let type_len = section_len(type_section.buf.len())?;
    let str_len = section_len(str_bytes.len())?;

    let mut out = Writer::new(
        options.endianness,
        BTF_HEADER_LEN as usize + type_section.buf.len() + str_bytes.len(),
    );
    out.u16(BTF_MAGIC);
    out.u8(BTF_VERSION);
    out.u8(0);
    out.u32(BTF_HEADER_LEN);
    out.u32(0);
    out.u32(type_len);
    out.u32(type_len);
    out.u32(str_len);
    out.buf.extend_from_slice(&type_section.buf);
    out.buf.extend_from_slice(str_bytes);

    debug!(
        "Encoded {} BTF types: {} bytes of types, {} bytes of strings ({:?}, {:?})",
        types.len(),
        type_len,
        str_len,
        options.endianness,
        options.string_mode
    );
    Ok(out.buf)
}

fn section_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| {
        FormatError::BadHeader(format!("section of {len} bytes does not fit the header"))
    })
}

/// Copy the records with names re-interned into a fresh table
fn compact(btf: &Btf) -> Result<(Vec<BtfType>, StringTable)> {
    let mut table = StringTable::new();
    let mut types = Vec::with_capacity(btf.len());
    for (_, ty) in btf.types() {
        let mut ty = ty.clone();
        ty.remap_name_offsets(|offset| {
            if offset == 0 {
                return Ok(0);
            }
            let name = btf.string_at(offset)?;
            Ok(table.add(&name))
        })?;
        types.push(ty);
    }
    Ok((types, table))
}

fn info(ty: &BtfType, type_id: TypeId, vlen: usize, kind_flag: bool) -> Result<u32> {
    if vlen > MAX_VLEN {
        return Err(FormatError::TooManyMembers {
            type_id,
            count: vlen,
        });
    }
    Ok((u32::from(kind_flag) << 31) | ((ty.kind() as u32) << 24) | vlen as u32)
}

fn encode_type(w: &mut Writer, ty: &BtfType, type_id: TypeId) -> Result<()> {
    w.u32(ty.name_offset());
    match ty {
        BtfType::Int(t) => {
            w.u32(info(ty, type_id, 0, false)?);
            w.u32(t.size);
            w.u32(
                (u32::from(t.encoding.0) << 24) | (u32::from(t.offset) << 16) | u32::from(t.bits),
            );
        }
        BtfType::Ptr(r)
        | BtfType::Typedef(r)
        | BtfType::Volatile(r)
        | BtfType::Const(r)
        | BtfType::Restrict(r)
        | BtfType::TypeTag(r) => {
            w.u32(info(ty, type_id, 0, false)?);
            w.type_id(r.type_id);
        }
        BtfType::Array(a) => {
            w.u32(info(ty, type_id, 0, false)?);
            w.u32(0);
            w.type_id(a.element_type);
            w.type_id(a.index_type);
            w.u32(a.len);
        }
        BtfType::Struct(c) | BtfType::Union(c) => {
            w.u32(info(ty, type_id, c.members.len(), c.kind_flag)?);
            w.u32(c.size);
            for member in &c.members {
                w.u32(member.name_offset);
                w.type_id(member.type_id);
                w.u32(member.offset);
            }
        }
        BtfType::Enum(e) => {
            w.u32(info(ty, type_id, e.values.len(), e.is_signed)?);
            w.u32(e.size);
            for value in &e.values {
                w.u32(value.name_offset);
                w.u32(value.value);
            }
        }
        BtfType::Enum64(e) => {
            w.u32(info(ty, type_id, e.values.len(), e.is_signed)?);
            w.u32(e.size);
            for value in &e.values {
                w.u32(value.name_offset);
                w.u32(value.value as u32);
                w.u32((value.value >> 32) as u32);
            }
        }
        BtfType::Fwd(f) => {
            w.u32(info(ty, type_id, 0, f.is_union)?);
            w.u32(0);
        }
        BtfType::Func(f) => {
            w.u32(info(ty, type_id, f.linkage as usize, false)?);
            w.type_id(f.proto);
        }
        BtfType::FuncProto(p) => {
            w.u32(info(ty, type_id, p.params.len(), false)?);
            w.type_id(p.return_type);
            for param in &p.params {
                w.u32(param.name_offset);
                w.type_id(param.type_id);
            }
        }
        BtfType::Var(v) => {
            w.u32(info(ty, type_id, 0, false)?);
            w.type_id(v.type_id);
            w.u32(v.linkage as u32);
        }
        BtfType::DataSec(d) => {
            w.u32(info(ty, type_id, d.entries.len(), false)?);
            w.u32(d.size);
            for entry in &d.entries {
                w.type_id(entry.type_id);
                w.u32(entry.offset);
                w.u32(entry.size);
            }
        }
        BtfType::Float(f) => {
            w.u32(info(ty, type_id, 0, false)?);
            w.u32(f.size);
        }
        BtfType::DeclTag(t) => {
            w.u32(info(ty, type_id, 0, false)?);
            w.type_id(t.type_id);
            w.u32(t.component_idx as u32);
        }
    }
    Ok(())
}

impl Btf {
    /// Encode little-endian with the string table preserved
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(self, &EncodeOptions::default())
    }

    pub fn to_bytes_with(&self, options: &EncodeOptions) -> Result<Vec<u8>> {
        encode(self, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Composite, IntEncoding, Member};

    #[test]
    fn test_header_layout() {
        let mut btf = Btf::new();
        btf.add_int("int", 4, IntEncoding::SIGNED);
        let bytes = btf.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x9f, 0xeb, 1, 0]);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 24);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(bytes[12..16].try_into().unwrap()), 16);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 16);
        assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 5);
        assert_eq!(bytes.len(), 24 + 16 + 5);
        assert_eq!(&bytes[40..], b"\0int\0");
    }

    #[test]
    fn test_int_payload() {
        let mut btf = Btf::new();
        btf.add_int("_Bool", 1, IntEncoding::BOOL);
        let bytes = btf.to_bytes().unwrap();
        let info = u32::from_le_bytes(bytes[28..32].try_into().unwrap());
        let word = u32::from_le_bytes(bytes[36..40].try_into().unwrap());
        assert_eq!(info, 1 << 24);
        assert_eq!(word, (4 << 24) | 8);
    }

    #[test]
    fn test_self_pointer_is_not_encoded() {
        let mut btf = Btf::new();
        btf.add_ptr(TypeId(1));
        assert!(matches!(
            btf.to_bytes(),
            Err(FormatError::CyclicType { type_id: TypeId(1), .. })
        ));
    }

    #[test]
    fn test_too_many_members() {
        let mut btf = Btf::new();
        let int = btf.add_int("int", 4, IntEncoding::SIGNED);
        let members = (0..=MAX_VLEN as u32)
            .map(|i| Member {
                name_offset: 0,
                type_id: int,
                offset: i * 32,
            })
            .collect();
        btf.append(BtfType::Struct(Composite {
            name_offset: 0,
            size: 4 * (MAX_VLEN as u32 + 1),
            kind_flag: false,
            members,
        }));
        assert!(matches!(
            btf.to_bytes(),
            Err(FormatError::TooManyMembers {
                type_id: TypeId(2),
                count: 65536
            })
        ));
    }

    #[test]
    fn test_compact_drops_unused_strings() {
        let mut btf = Btf::new();
        btf.add_string("unused");
        btf.add_int("int", 4, IntEncoding::SIGNED);
        let options = EncodeOptions::default().with_string_mode(StringMode::Compact);
        let bytes = btf.to_bytes_with(&options).unwrap();
        assert!(bytes.ends_with(b"\0int\0"));

        let decoded = Btf::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.name_of(TypeId(1)).unwrap(), "int");
        assert_eq!(decoded.strings().as_bytes(), b"\0int\0");
    }

    #[test]
    fn test_big_endian_output() {
        let mut btf = Btf::new();
        btf.add_int("int", 4, IntEncoding::SIGNED);
        let options = EncodeOptions::default().with_endianness(Endianness::Big);
        let bytes = btf.to_bytes_with(&options).unwrap();
        assert_eq!(&bytes[..2], &[0xeb, 0x9f]);
        let decoded = Btf::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.endianness(), Endianness::Big);
        assert_eq!(EncodeOptions::for_btf(&decoded).endianness, Endianness::Big);
        assert_eq!(decoded.to_bytes_with(&EncodeOptions::for_btf(&decoded)).unwrap(), bytes);
    }
}
