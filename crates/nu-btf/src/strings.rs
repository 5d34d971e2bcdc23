//! BTF string table
//!
//! A flat buffer of NUL-terminated strings addressed by byte offset. Offset 0
//! is always the empty string. Decoded tables are kept byte-for-byte so that
//! re-encoding reproduces the input; strings added afterwards are appended.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::{FormatError, Result};

#[derive(Debug, Clone)]
pub struct StringTable {
    data: Vec<u8>,
    /// Offsets of strings already present, used to deduplicate `add`
    interned: HashMap<Vec<u8>, u32>,
}

impl StringTable {
    /// Create a table holding only the empty string
    pub fn new() -> Self {
        let mut interned = HashMap::new();
        interned.insert(Vec::new(), 0);
        Self {
            data: vec![0],
            interned,
        }
    }

    /// Wrap a raw string section without re-validating its contents
    ///
    /// Offset 0 names the empty string even when the section does not start
    /// with a NUL byte.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mut interned = HashMap::new();
        interned.insert(Vec::new(), 0);
        let mut start = 0usize;
        while start < data.len() {
            let Some(len) = data[start..].iter().position(|b| *b == 0) else {
                break;
            };
            if start > 0 {
                interned
                    .entry(data[start..start + len].to_vec())
                    .or_insert(start as u32);
            }
            start += len + 1;
        }
        Self { data, interned }
    }

    /// Intern a string, returning its offset
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(offset) = self.interned.get(s.as_bytes()) {
            return *offset;
        }
        if self.data.is_empty() {
            // offset 0 must stay the empty string
            self.data.push(0);
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.interned.insert(s.as_bytes().to_vec(), offset);
        offset
    }

    /// Resolve an offset to the string starting there
    pub fn get(&self, offset: u32) -> Result<Cow<'_, str>> {
        if offset == 0 {
            return Ok(Cow::Borrowed(""));
        }
        let start = offset as usize;
        if start >= self.data.len() {
            return Err(FormatError::InvalidStringOffset(offset));
        }
        let len = self.data[start..]
            .iter()
            .position(|b| *b == 0)
            .ok_or(FormatError::InvalidStringOffset(offset))?;
        Ok(String::from_utf8_lossy(&self.data[start..start + len]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StringTable {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for StringTable {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_table_has_empty_string() {
        let table = StringTable::new();
        assert_eq!(table.as_bytes(), b"\0");
        assert_eq!(table.get(0).unwrap(), "");
    }

    #[test]
    fn test_add_deduplicates() {
        let mut table = StringTable::new();
        let a = table.add("int");
        let b = table.add("char");
        let c = table.add("int");
        assert_eq!(a, 1);
        assert_eq!(b, 5);
        assert_eq!(a, c);
        assert_eq!(table.as_bytes(), b"\0int\0char\0");
        assert_eq!(table.add(""), 0);
    }

    #[test]
    fn test_from_bytes_is_verbatim() {
        let raw = b"\0foo\0bar\0foo\0".to_vec();
        let mut table = StringTable::from_bytes(raw.clone());
        assert_eq!(table.as_bytes(), raw.as_slice());
        assert_eq!(table.get(5).unwrap(), "bar");
        // the first copy wins for deduplication
        assert_eq!(table.add("foo"), 1);
        assert_eq!(table.get(9).unwrap(), "foo");
    }

    #[test]
    fn test_offset_inside_a_string_resolves_suffix() {
        let table = StringTable::from_bytes(b"\0counter\0".to_vec());
        assert_eq!(table.get(4).unwrap(), "nter");
    }

    #[test]
    fn test_out_of_range_offset() {
        let table = StringTable::from_bytes(b"\0abc".to_vec());
        assert!(matches!(
            table.get(100),
            Err(FormatError::InvalidStringOffset(100))
        ));
        // unterminated string
        assert!(matches!(
            table.get(1),
            Err(FormatError::InvalidStringOffset(1))
        ));
    }

    #[test]
    fn test_empty_table() {
        let mut table = StringTable::from_bytes(Vec::new());
        assert!(table.is_empty());
        assert_eq!(table.get(0).unwrap(), "");
        assert_eq!(table.add("x"), 1);
        assert_eq!(table.as_bytes(), b"\0x\0");
    }

    #[test]
    fn test_offset_zero_is_always_empty() {
        let mut table = StringTable::from_bytes(b"abc\0def\0".to_vec());
        assert_eq!(table.get(0).unwrap(), "");
        assert_eq!(table.get(4).unwrap(), "def");
        assert_eq!(table.add(""), 0);
        assert_eq!(table.add("abc"), 8);
        assert_eq!(table.as_bytes(), b"abc\0def\0abc\0");
    }
}
