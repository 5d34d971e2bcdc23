//! Error type shared by every BTF operation

use thiserror::Error;

use crate::types::TypeId;

/// Convenience alias used throughout the crate
pub type Result<T, E = FormatError> = std::result::Result<T, E>;

/// Errors that can occur while decoding, validating, encoding or querying BTF
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Invalid BTF header: {0}")]
    BadHeader(String),

    #[error("BTF data truncated: needed {needed} bytes at offset {offset}, only {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Unknown BTF kind {kind} for type {type_id}")]
    UnknownKind { type_id: TypeId, kind: u32 },

    #[error("Invalid linkage {linkage} for type {type_id}")]
    InvalidLinkage { type_id: TypeId, linkage: u32 },

    #[error("Type {type_id} references missing type {target}")]
    DanglingReference { type_id: TypeId, target: TypeId },

    #[error("Cyclic type reference through type {type_id} ({cycles} cycle(s) found)")]
    CyclicType { type_id: TypeId, cycles: usize },

    #[error("Type {type_id} has {count} entries, more than BTF can encode")]
    TooManyMembers { type_id: TypeId, count: usize },

    #[error("Unknown BTF type id {0}")]
    UnknownTypeId(TypeId),

    #[error("Unknown BTF type name '{0}'")]
    UnknownTypeName(String),

    #[error("Invalid BTF string offset {0}")]
    InvalidStringOffset(u32),

    #[error("Unexpected type {type_id}: expected {expected}")]
    UnexpectedType {
        type_id: TypeId,
        expected: &'static str,
    },

    #[error("Section '{0}' not found in ELF object")]
    MissingSection(String),

    #[error("ELF parse error: {0}")]
    Elf(#[from] object::read::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FormatError {
    pub(crate) fn truncated(offset: usize, needed: usize, available: usize) -> Self {
        FormatError::Truncated {
            offset,
            needed,
            available,
        }
    }

    /// Whether the error describes malformed input bytes rather than a bad graph
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            FormatError::BadHeader(_)
                | FormatError::Truncated { .. }
                | FormatError::UnknownKind { .. }
                | FormatError::InvalidLinkage { .. }
        )
    }

    /// Whether the error means the graph cannot be encoded
    pub fn is_unencodable(&self) -> bool {
        matches!(
            self,
            FormatError::CyclicType { .. }
                | FormatError::DanglingReference { .. }
                | FormatError::TooManyMembers { .. }
        )
    }
}
