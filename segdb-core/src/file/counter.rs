//! Persistent file-key counter (`counter.domain`)

use crate::error::IoContext;
use crate::{DomainError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const COUNTER_FILE: &str = "counter.domain";

/// Monotonic counter handing out data file keys, stored as a 4-byte
/// little-endian integer
pub(crate) struct FileCounter {
    path: PathBuf,
    file: File,
    value: u32,
}

impl FileCounter {
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(COUNTER_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .context("open counter file", &path)?;

        let mut data = Vec::with_capacity(4);
        file.read_to_end(&mut data)
            .context("read counter file", &path)?;

        let value = match data.len() {
            0 => 0,
            4 => u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            n => {
                return Err(DomainError::Corruption(format!(
                    "counter file {:?} has length {}, expected 4",
                    path, n
                )))
            }
        };

        Ok(Self { path, file, value })
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    /// Raise the counter so no key up to `value` is handed out again
    pub fn raise_to(&mut self, value: u32) -> Result<()> {
        if value > self.value {
            self.store(value)?;
        }
        Ok(())
    }

    /// Reserve the next file key
    pub fn next(&mut self) -> Result<u16> {
        let next = self.value + 1;
        let key = u16::try_from(next).map_err(|_| {
            DomainError::Internal(format!("file key space exhausted at {}", self.value))
        })?;
        self.store(next)?;
        Ok(key)
    }

    fn store(&mut self, value: u32) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .context("seek counter file", &self.path)?;
        self.file
            .write_all(&value.to_le_bytes())
            .context("write counter file", &self.path)?;
        self.value = value;
        Ok(())
    }
}
