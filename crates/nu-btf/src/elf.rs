//! Loading BTF from ELF objects
//!
//! Compiled BPF objects carry their type information in a `.BTF` section.
//! Section lookup is left to the `object` crate.

use std::path::Path;

use log::debug;
use object::{Object, ObjectSection};

use crate::btf::Btf;
use crate::error::{FormatError, Result};

/// Name of the section holding BTF data
pub const BTF_SECTION: &str = ".BTF";

/// Raw contents of the `.BTF` section of an ELF object
pub fn btf_section_from_elf(data: &[u8]) -> Result<&[u8]> {
    let file = object::File::parse(data)?;
    let section = file
        .section_by_name(BTF_SECTION)
        .ok_or_else(|| FormatError::MissingSection(BTF_SECTION.to_string()))?;
    let bytes = section.data()?;
    debug!("Found {BTF_SECTION} section of {} bytes", bytes.len());
    Ok(bytes)
}

impl Btf {
    /// Decode the `.BTF` section of an in-memory ELF object
    pub fn from_elf(data: &[u8]) -> Result<Btf> {
        Btf::from_bytes(btf_section_from_elf(data)?)
    }

    /// Read an ELF object from disk and decode its `.BTF` section
    pub fn from_elf_file(path: impl AsRef<Path>) -> Result<Btf> {
        let path = path.as_ref();
        debug!("Loading BTF from {}", path.display());
        let data = std::fs::read(path)?;
        Btf::from_elf(&data)
    }
}

#[cfg(test)]
mod tests {
    use object::write::Object as WriteObject;
    use object::{Architecture, BinaryFormat, Endianness, SectionKind};

    use super::*;
    use crate::types::IntEncoding;

    fn elf_with_sections(sections: &[(&str, &[u8])]) -> Vec<u8> {
        let mut obj = WriteObject::new(BinaryFormat::Elf, Architecture::Bpf, Endianness::Little);
        for (name, data) in sections {
            let id = obj.add_section(vec![], name.as_bytes().to_vec(), SectionKind::Metadata);
            obj.append_section_data(id, data, 1);
        }
        obj.write().unwrap()
    }

    #[test]
    fn test_extracts_btf_section() {
        let mut btf = Btf::new();
        btf.add_int("int", 4, IntEncoding::SIGNED);
        let raw = btf.to_bytes().unwrap();
        let elf = elf_with_sections(&[(BTF_SECTION, &raw)]);

        assert_eq!(btf_section_from_elf(&elf).unwrap(), raw.as_slice());
        assert_eq!(Btf::from_elf(&elf).unwrap(), btf);
    }

    #[test]
    fn test_missing_section() {
        let elf = elf_with_sections(&[("license", b"GPL\0")]);
        assert!(matches!(
            Btf::from_elf(&elf),
            Err(FormatError::MissingSection(name)) if name == BTF_SECTION
        ));
    }

    #[test]
    fn test_not_an_elf() {
        assert!(matches!(
            btf_section_from_elf(b"definitely not elf"),
            Err(FormatError::Elf(_))
        ));
    }
}
