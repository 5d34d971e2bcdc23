//! BTF (BPF Type Format) reading, writing and inspection
//!
//! This crate decodes `.BTF` sections into an in-memory type graph, lets
//! callers build or edit graphs, and writes them back out. It provides:
//! - Decoding and encoding in either byte order
//! - Cycle and dangling-reference validation before encoding
//! - A stable JSON projection with C-like type names
//! - Queries (lookup by name, type size, typedef resolution, traversal)
//! - libbpf-style BTF-defined map declarations
//! - `.BTF` extraction from ELF objects

mod btf;
mod decode;
mod encode;
mod error;
mod json;
mod strings;
mod types;
mod validate;

pub mod elf;
pub mod maps;

pub use btf::{Btf, POINTER_SIZE};
pub use decode::{BTF_HEADER_LEN, BTF_MAGIC, BTF_VERSION, BtfHeader, decode};
pub use encode::{EncodeOptions, StringMode, encode};
pub use error::{FormatError, Result};
pub use json::{pretty_print_json, to_json, to_json_filtered, to_json_pretty};
pub use strings::StringTable;
pub use types::{
    Array, BtfKind, BtfType, Composite, DataSec, DataSecEntry, DeclTag, Enum, Enum64,
    Enum64Value, EnumValue, Float, Func, FuncLinkage, FuncProto, Fwd, Int, IntEncoding, Member,
    Param, Reference, TypeId, Var, VarLinkage,
};
pub use validate::{Cycle, Validator};

pub use object::Endianness;
