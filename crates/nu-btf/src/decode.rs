//! BTF decoding
//!
//! Layout of a `.BTF` section:
//! - a header (magic, version, flags, header length, then offset/length of
//!   the type and string sections, both relative to the end of the header)
//! - the type section: one variable-length record per type, in id order
//! - the string section: NUL-terminated names
//!
//! The byte order is taken from the magic, so both little- and big-endian
//! objects decode.

use log::{debug, trace};
use object::endian::{Endian, Endianness};

use crate::btf::Btf;
use crate::error::{FormatError, Result};
use crate::strings::StringTable;
use crate::types::{
    Array, BtfKind, BtfType, Composite, DataSec, DataSecEntry, DeclTag, Enum, Enum64,
    Enum64Value, EnumValue, Float, Func, FuncLinkage, FuncProto, Fwd, Int, IntEncoding, Member,
    Param, Reference, TypeId, Var, VarLinkage,
};

pub const BTF_MAGIC: u16 = 0xeb9f;
pub const BTF_VERSION: u8 = 1;
/// Length of the header this crate reads and writes
pub const BTF_HEADER_LEN: u32 = 24;

/// The fixed `.BTF` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtfHeader {
    pub magic: u16,
    pub version: u8,
    pub flags: u8,
    pub hdr_len: u32,
    pub type_off: u32,
    pub type_len: u32,
    pub str_off: u32,
    pub str_len: u32,
}

impl BtfHeader {
    /// Parse and sanity-check the header, returning it with the detected byte order
    pub fn parse(data: &[u8]) -> Result<(BtfHeader, Endianness)> {
        let endian = match data {
            [0x9f, 0xeb, ..] => Endianness::Little,
            [0xeb, 0x9f, ..] => Endianness::Big,
            [_, _, ..] => {
                return Err(FormatError::BadHeader(format!(
                    "bad magic 0x{:02x}{:02x}",
                    data[0], data[1]
                )));
            }
            _ => return Err(FormatError::truncated(0, 2, data.len())),
        };

        let mut reader = Reader::new(data, 0, data.len(), endian);
        let header = BtfHeader {
            magic: reader.u16()?,
            version: reader.u8()?,
            flags: reader.u8()?,
            hdr_len: reader.u32()?,
            type_off: reader.u32()?,
            type_len: reader.u32()?,
            str_off: reader.u32()?,
            str_len: reader.u32()?,
        };

        if header.version != BTF_VERSION {
            return Err(FormatError::BadHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }
        if header.hdr_len < BTF_HEADER_LEN {
            return Err(FormatError::BadHeader(format!(
                "header length {} is shorter than {BTF_HEADER_LEN}",
                header.hdr_len
            )));
        }
        if header.hdr_len as usize > data.len() {
            return Err(FormatError::truncated(
                0,
                header.hdr_len as usize,
                data.len(),
            ));
        }

        let types = header.section(header.type_off, header.type_len)?;
        let strings = header.section(header.str_off, header.str_len)?;
        for (name, range) in [("type", &types), ("string", &strings)] {
            if range.end > data.len() {
                return Err(FormatError::truncated(
                    range.start,
                    range.end - range.start,
                    data.len().saturating_sub(range.start),
                ));
            }
            trace!("BTF {name} section at {range:?}");
        }
        if !types.is_empty()
            && !strings.is_empty()
            && types.start < strings.end
            && strings.start < types.end
        {
            return Err(FormatError::BadHeader(
                "type and string sections overlap".to_string(),
            ));
        }
        if !strings.is_empty() && data[strings.start] != 0 {
            return Err(FormatError::BadHeader(
                "string section does not start with the empty string".to_string(),
            ));
        }

        Ok((header, endian))
    }

    /// Absolute byte range of a section given its header-relative offset
    fn section(&self, offset: u32, len: u32) -> Result<std::ops::Range<usize>> {
        let start = (self.hdr_len as usize)
            .checked_add(offset as usize)
            .ok_or_else(|| FormatError::BadHeader(format!("section offset {offset} overflows")))?;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| FormatError::BadHeader(format!("section length {len} overflows")))?;
        Ok(start..end)
    }
}

/// Bounds-checked cursor over part of the input buffer
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    endian: Endianness,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], pos: usize, end: usize, endian: Endianness) -> Self {
        Self {
            data,
            pos,
            end,
            endian,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.end
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let available = self.end.saturating_sub(self.pos);
        if available < N {
            return Err(FormatError::truncated(self.pos, N, available));
        }
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(self.endian.read_u16_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(self.endian.read_u32_bytes(self.take()?))
    }

    fn type_id(&mut self) -> Result<TypeId> {
        Ok(TypeId(self.u32()?))
    }

    /// Fail early when a record announces more entries than the section holds
    fn ensure(&self, needed: usize) -> Result<()> {
        let available = self.end.saturating_sub(self.pos);
        if available < needed {
            return Err(FormatError::truncated(self.pos, needed, available));
        }
        Ok(())
    }
}

/// Decode a raw `.BTF` section into a graph
pub fn decode(data: &[u8]) -> Result<Btf> {
    let (header, endian) = BtfHeader::parse(data)?;
    let types_range = header.section(header.type_off, header.type_len)?;
    let strings_range = header.section(header.str_off, header.str_len)?;

    let mut reader = Reader::new(data, types_range.start, types_range.end, endian);
    let mut types = Vec::new();
    while !reader.is_empty() {
        let type_id = TypeId(types.len() as u32 + 1);
        let ty = decode_type(&mut reader, type_id)?;
        trace!("BTF type {type_id}: {}", ty.kind());
        types.push(ty);
    }

    let strings = StringTable::from_bytes(data[strings_range].to_vec());
    debug!(
        "Decoded {} BTF types and {} bytes of strings ({:?})",
        types.len(),
        strings.len(),
        endian
    );

    Ok(Btf::from_parts(types, strings, endian))
}

fn decode_type(reader: &mut Reader<'_>, type_id: TypeId) -> Result<BtfType> {
    let name_offset = reader.u32()?;
    let info = reader.u32()?;
    let size_or_type = reader.u32()?;

    let vlen = (info & 0xffff) as usize;
    let raw_kind = (info >> 24) & 0x1f;
    let kind_flag = info >> 31 == 1;
    let kind = BtfKind::try_from(raw_kind)
        .map_err(|kind| FormatError::UnknownKind { type_id, kind })?;
    let uses_flag = matches!(
        kind,
        BtfKind::Struct | BtfKind::Union | BtfKind::Enum | BtfKind::Enum64 | BtfKind::Fwd
    );
    let uses_vlen = matches!(
        kind,
        BtfKind::Struct
            | BtfKind::Union
            | BtfKind::Enum
            | BtfKind::Enum64
            | BtfKind::Func
            | BtfKind::FuncProto
            | BtfKind::DataSec
    );
    // re-encoding writes these bits as zero
    if (kind_flag && !uses_flag) || (vlen != 0 && !uses_vlen) || info & 0x60ff_0000 != 0 {
        debug!("BTF type {type_id}: ignoring unused info bits {info:#010x} of {kind}");
    }

    let reference = Reference {
        name_offset,
        type_id: TypeId(size_or_type),
    };

    let ty = match kind {
        BtfKind::Int => {
            let word = reader.u32()?;
            BtfType::Int(Int {
                name_offset,
                size: size_or_type,
                encoding: IntEncoding(((word >> 24) & 0x0f) as u8),
                offset: ((word >> 16) & 0xff) as u8,
                bits: (word & 0xff) as u8,
            })
        }
        BtfKind::Ptr => BtfType::Ptr(reference),
        BtfKind::Typedef => BtfType::Typedef(reference),
        BtfKind::Volatile => BtfType::Volatile(reference),
        BtfKind::Const => BtfType::Const(reference),
        BtfKind::Restrict => BtfType::Restrict(reference),
        BtfKind::TypeTag => BtfType::TypeTag(reference),
        BtfKind::Array => BtfType::Array(Array {
            name_offset,
            element_type: reader.type_id()?,
            index_type: reader.type_id()?,
            len: reader.u32()?,
        }),
        BtfKind::Struct | BtfKind::Union => {
            reader.ensure(vlen * 12)?;
            let mut members = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                members.push(Member {
                    name_offset: reader.u32()?,
                    type_id: reader.type_id()?,
                    offset: reader.u32()?,
                });
            }
            let composite = Composite {
                name_offset,
                size: size_or_type,
                kind_flag,
                members,
            };
            if kind == BtfKind::Struct {
                BtfType::Struct(composite)
            } else {
                BtfType::Union(composite)
            }
        }
        BtfKind::Enum => {
            reader.ensure(vlen * 8)?;
            let mut values = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                values.push(EnumValue {
                    name_offset: reader.u32()?,
                    value: reader.u32()?,
                });
            }
            BtfType::Enum(Enum {
                name_offset,
                size: size_or_type,
                is_signed: kind_flag,
                values,
            })
        }
        BtfKind::Enum64 => {
            reader.ensure(vlen * 12)?;
            let mut values = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                let name_offset = reader.u32()?;
                let lo = reader.u32()?;
                let hi = reader.u32()?;
                values.push(Enum64Value {
                    name_offset,
                    value: (u64::from(hi) << 32) | u64::from(lo),
                });
            }
            BtfType::Enum64(Enum64 {
                name_offset,
                size: size_or_type,
                is_signed: kind_flag,
                values,
            })
        }
        BtfKind::Fwd => BtfType::Fwd(Fwd {
            name_offset,
            is_union: kind_flag,
        }),
        BtfKind::Func => {
            let linkage = FuncLinkage::try_from(vlen as u32)
                .map_err(|linkage| FormatError::InvalidLinkage { type_id, linkage })?;
            BtfType::Func(Func {
                name_offset,
                proto: TypeId(size_or_type),
                linkage,
            })
        }
        BtfKind::FuncProto => {
            reader.ensure(vlen * 8)?;
            let mut params = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                params.push(Param {
                    name_offset: reader.u32()?,
                    type_id: reader.type_id()?,
                });
            }
            BtfType::FuncProto(FuncProto {
                name_offset,
                return_type: TypeId(size_or_type),
                params,
            })
        }
        BtfKind::Var => {
            let linkage = VarLinkage::try_from(reader.u32()?)
                .map_err(|linkage| FormatError::InvalidLinkage { type_id, linkage })?;
            BtfType::Var(Var {
                name_offset,
                type_id: TypeId(size_or_type),
                linkage,
            })
        }
        BtfKind::DataSec => {
            reader.ensure(vlen * 12)?;
            let mut entries = Vec::with_capacity(vlen);
            for _ in 0..vlen {
                entries.push(DataSecEntry {
                    type_id: reader.type_id()?,
                    offset: reader.u32()?,
                    size: reader.u32()?,
                });
            }
            BtfType::DataSec(DataSec {
                name_offset,
                size: size_or_type,
                entries,
            })
        }
        BtfKind::Float => BtfType::Float(Float {
            name_offset,
            size: size_or_type,
        }),
        BtfKind::DeclTag => BtfType::DeclTag(DeclTag {
            name_offset,
            type_id: TypeId(size_or_type),
            component_idx: reader.u32()? as i32,
        }),
    };

    Ok(ty)
}

impl Btf {
    /// Decode a raw `.BTF` section
    pub fn from_bytes(data: &[u8]) -> Result<Btf> {
        decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Header followed by the given type and string sections (little-endian)
    fn section(types: &[u8], strings: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&BTF_MAGIC.to_le_bytes());
        data.push(BTF_VERSION);
        data.push(0);
        data.extend_from_slice(&BTF_HEADER_LEN.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(types.len() as u32).to_le_bytes());
        data.extend_from_slice(&(types.len() as u32).to_le_bytes());
        data.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        data.extend_from_slice(types);
        data.extend_from_slice(strings);
        data
    }

    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_parse_header() {
        let data = section(&[], b"\0");
        let (header, endian) = BtfHeader::parse(&data).unwrap();
        assert_eq!(endian, Endianness::Little);
        assert_eq!(header.magic, BTF_MAGIC);
        assert_eq!(header.hdr_len, 24);
        assert_eq!(header.str_len, 1);
    }

    #[test]
    fn test_decode_int_and_pointer() {
        // int: name 1, INT, size 4, signed 32-bit; ptr to 1
        let types = words(&[1, 1 << 24, 4, (1 << 24) | 32, 0, 2 << 24, 1]);
        let btf = decode(&section(&types, b"\0int\0")).unwrap();
        assert_eq!(btf.len(), 2);
        assert_eq!(
            btf.type_by_id(TypeId(1)).unwrap(),
            &BtfType::Int(Int {
                name_offset: 1,
                size: 4,
                encoding: IntEncoding::SIGNED,
                offset: 0,
                bits: 32,
            })
        );
        assert_eq!(btf.dereference_pointer(TypeId(2)).unwrap(), TypeId(1));
        assert_eq!(btf.name_of(TypeId(1)).unwrap(), "int");
    }

    #[test]
    fn test_bad_magic() {
        let mut data = section(&[], b"\0");
        data[0] = 0x12;
        assert!(matches!(decode(&data), Err(FormatError::BadHeader(_))));
    }

    #[test]
    fn test_bad_version() {
        let mut data = section(&[], b"\0");
        data[2] = 2;
        assert!(matches!(decode(&data), Err(FormatError::BadHeader(_))));
    }

    #[test]
    fn test_string_section_must_start_with_nul() {
        let types = words(&[0, 2 << 24, 0]);
        assert!(matches!(
            decode(&section(&types, b"int\0")),
            Err(FormatError::BadHeader(_))
        ));

        let empty = decode(&section(&types, b"")).unwrap();
        assert_eq!(empty.name_of(TypeId(1)).unwrap(), "");
    }

    #[test]
    fn test_unused_info_bits_are_dropped() {
        // PTR to void with kind_flag, vlen 3 and a reserved bit set
        let types = words(&[0, (1 << 31) | (1 << 20) | (2 << 24) | 3, 0]);
        let btf = decode(&section(&types, b"\0")).unwrap();
        assert_eq!(
            btf.type_by_id(TypeId(1)).unwrap(),
            &BtfType::Ptr(Reference {
                name_offset: 0,
                type_id: TypeId::VOID,
            })
        );
        let encoded = btf.to_bytes().unwrap();
        assert_eq!(encoded[28..32], (2u32 << 24).to_le_bytes());
        assert_eq!(encoded[..28], section(&types, b"\0")[..28]);
    }

    #[test]
    fn test_short_buffer() {
        assert!(matches!(
            decode(&[0x9f]),
            Err(FormatError::Truncated { .. })
        ));
        let data = section(&[], b"\0");
        assert!(matches!(
            decode(&data[..10]),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_string_section_past_end() {
        let mut data = section(&[], b"\0abc\0");
        data.truncate(data.len() - 2);
        assert!(matches!(
            decode(&data),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_record_past_end_of_type_section() {
        // struct claiming two members but carrying only one
        let types = words(&[0, (4 << 24) | 2, 8, 0, 0, 0]);
        assert!(matches!(
            decode(&section(&types, b"\0")),
            Err(FormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let types = words(&[0, 25 << 24, 0]);
        assert!(matches!(
            decode(&section(&types, b"\0")),
            Err(FormatError::UnknownKind {
                type_id: TypeId(1),
                kind: 25
            })
        ));
        let types = words(&[0, 0, 0]);
        assert!(matches!(
            decode(&section(&types, b"\0")),
            Err(FormatError::UnknownKind { kind: 0, .. })
        ));
    }

    #[test]
    fn test_invalid_func_linkage() {
        let types = words(&[0, (12 << 24) | 7, 0]);
        assert!(matches!(
            decode(&section(&types, b"\0")),
            Err(FormatError::InvalidLinkage { linkage: 7, .. })
        ));
    }

    #[test]
    fn test_overlapping_sections() {
        let types = words(&[0, 2 << 24, 0]);
        let mut data = section(&types, b"\0");
        // point the string section into the type section
        data[16..20].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(decode(&data), Err(FormatError::BadHeader(_))));
    }

    #[test]
    fn test_big_endian_header() {
        let mut data = Vec::new();
        data.extend_from_slice(&BTF_MAGIC.to_be_bytes());
        data.push(BTF_VERSION);
        data.push(0);
        for word in [24u32, 0, 12, 12, 1] {
            data.extend_from_slice(&word.to_be_bytes());
        }
        for word in [0u32, 2 << 24, 0] {
            data.extend_from_slice(&word.to_be_bytes());
        }
        data.push(0);
        let btf = decode(&data).unwrap();
        assert_eq!(btf.endianness(), Endianness::Big);
        assert_eq!(btf.dereference_pointer(TypeId(1)).unwrap(), TypeId::VOID);
    }
}
