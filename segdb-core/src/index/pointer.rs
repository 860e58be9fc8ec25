//! Pointer - locates one domain's bytes on disk

use crate::types::TimeRange;
use serde::Serialize;
use std::fmt;

/// Location of a domain inside a numbered data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pointer {
    /// Time range covered by the domain
    pub time_range: TimeRange,
    /// Data file holding the bytes; 0 is never a valid key
    pub file_key: u16,
    /// Byte offset of the domain within the file
    pub offset: u32,
    /// Number of bytes in the domain
    pub size: u32,
}

impl Pointer {
    pub fn new(time_range: TimeRange, file_key: u16, offset: u32, size: u32) -> Self {
        Self {
            time_range,
            file_key,
            offset,
            size,
        }
    }

    /// Offset one past the last byte of the domain
    pub fn end_offset(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> file {} [{}, +{})",
            self.time_range, self.file_key, self.offset, self.size
        )
    }
}
