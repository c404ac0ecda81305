//! IDA style byte patterns: `"48 8D 05 ? ? ? ?"`.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::ffi::address::Address;
use crate::memory::ReadCursor;

/// Cell value for "any byte"
pub const WILDCARD: i16 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("Invalid hex byte '{text}' at offset {offset}")]
    InvalidHex { offset: usize, text: String },
}

pub type PatternResult<T> = std::result::Result<T, PatternError>;

/// Immutable byte pattern; `-1` matches any byte
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    cells: Vec<i16>,
}

impl Pattern {
    /// Parses pattern text.
    ///
    /// Whitespace is ignored, each `?` is one wildcard byte and every other
    /// pair of characters must be a hex byte. A trailing single digit is
    /// dropped.
    pub fn new(text: &str) -> PatternResult<Self> {
        let compact: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut cells = Vec::with_capacity(compact.len() / 2 + 1);
        let mut i = 0;

        while i < compact.len() {
            if compact[i] == '?' {
                cells.push(WILDCARD);
                i += 1;
                continue;
            }

            if i + 1 >= compact.len() {
                log::debug!("Dropping dangling nibble '{}' in pattern '{text}'", compact[i]);
                break;
            }

            let pair: String = compact[i..i + 2].iter().collect();
            let byte = u8::from_str_radix(&pair, 16).map_err(|_| PatternError::InvalidHex {
                offset: i,
                text: pair.clone(),
            })?;

            cells.push(byte as i16);
            i += 2;
        }

        Ok(Self { cells })
    }

    /// Literal pattern without wildcards
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            cells: bytes.iter().map(|&b| b as i16).collect(),
        }
    }

    pub fn cells(&self) -> &[i16] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// True if `bytes` starts with this pattern
    pub fn matches(&self, bytes: &[u8]) -> bool {
        if bytes.len() < self.cells.len() {
            return false;
        }

        self.cells
            .iter()
            .zip(bytes)
            .all(|(&cell, &byte)| cell == WILDCARD || cell == byte as i16)
    }

    /// Smallest index in `haystack` where the pattern matches
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        debug_assert!(!self.is_empty(), "empty pattern");

        if self.is_empty() || haystack.len() < self.len() {
            return None;
        }

        (0..=haystack.len() - self.len()).find(|&i| self.matches(&haystack[i..]))
    }

    /// First match inside `[start, start + length)` of live memory.
    ///
    /// Unreadable candidates are skipped by the pattern length.
    pub fn find(&self, start: Address, length: usize) -> Option<Address> {
        self.scan(start, length, true).into_iter().next()
    }

    /// Every match inside `[start, start + length)`
    pub fn find_all(&self, start: Address, length: usize) -> Vec<Address> {
        self.scan(start, length, false)
    }

    fn scan(&self, start: Address, length: usize, first_only: bool) -> Vec<Address> {
        debug_assert!(!self.is_empty(), "empty pattern");

        let mut found = Vec::new();

        if self.is_empty() || length < self.len() {
            return found;
        }

        let mut cursor = ReadCursor::new();
        let last = length - self.len();
        let mut offset = 0usize;

        while offset <= last {
            let candidate = start + offset;

            match cursor.with_slice(candidate, self.len(), |bytes| self.matches(bytes)) {
                None => {
                    offset += self.len();
                    continue;
                }
                Some(true) => {
                    found.push(candidate);
                    if first_only {
                        break;
                    }
                }
                Some(false) => {}
            }

            offset += 1;
        }

        found
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            if *cell == WILDCARD {
                f.write_str("?")?;
            } else {
                write!(f, "{cell:02X}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_wildcard() {
        let pattern = Pattern::new("90 90 ? EB").unwrap();
        assert_eq!(pattern.cells(), &[0x90, 0x90, -1, 0xEB]);
    }

    #[test]
    fn test_parse_ignores_spaces_and_drops_dangling_nibble() {
        assert_eq!(Pattern::new("9090?EB").unwrap().cells(), &[0x90, 0x90, -1, 0xEB]);
        assert_eq!(Pattern::new("48 8b 0").unwrap().cells(), &[0x48, 0x8B]);
        assert_eq!(Pattern::new("??").unwrap().cells(), &[-1, -1]);
    }

    #[test]
    fn test_parse_invalid_hex() {
        assert_eq!(
            Pattern::new("48 ZZ").unwrap_err(),
            PatternError::InvalidHex {
                offset: 2,
                text: "ZZ".to_string()
            }
        );
    }

    #[test]
    fn test_display() {
        let pattern: Pattern = "48 8D 05 ? ? ? ?".parse().unwrap();
        assert_eq!(pattern.to_string(), "48 8D 05 ? ? ? ?");
    }

    #[test]
    fn test_find_in_returns_smallest_index() {
        let pattern = Pattern::new("AA ? CC").unwrap();
        let haystack = [0x00, 0xAA, 0x01, 0xCC, 0xAA, 0x02, 0xCC];

        assert_eq!(pattern.find_in(&haystack), Some(1));
        assert_eq!(pattern.find_in(&haystack[2..]), Some(2));
        assert_eq!(pattern.find_in(&[0xAA, 0x00]), None);
    }

    #[test]
    fn test_wildcard_never_compared() {
        let pattern = Pattern::new("? ? ?").unwrap();
        assert!(pattern.matches(&[0x00, 0xFF, 0x7F]));
    }

    #[test]
    fn test_find_in_live_memory() {
        let mut buffer = vec![0u8; 512];
        buffer[300..304].copy_from_slice(&[0x48, 0x8D, 0x05, 0x10]);
        buffer[400..404].copy_from_slice(&[0x48, 0x8D, 0x05, 0x20]);

        let base = Address::from_ptr(buffer.as_ptr());
        let pattern = Pattern::new("48 8D 05 ?").unwrap();

        assert_eq!(pattern.find(base, buffer.len()), Some(base + 300));
        assert_eq!(pattern.find_all(base, buffer.len()), vec![base + 300, base + 400]);
        assert_eq!(pattern.find(base, 300), None);
    }

    #[test]
    fn test_find_match_at_window_end() {
        let buffer = [0u8, 0, 0, 0xDE, 0xAD];
        let base = Address::from_ptr(buffer.as_ptr());
        let pattern = Pattern::from_bytes(&[0xDE, 0xAD]);

        assert_eq!(pattern.find(base, buffer.len()), Some(base + 3));
    }

    #[test]
    fn test_find_skips_unreadable_memory() {
        let pattern = Pattern::new("90 90").unwrap();
        assert_eq!(pattern.find(Address::new(0x10), 0x100), None);
    }
}
