//! On-disk index format
//!
//! `index.domain` is a flat sequence of fixed-width little-endian records with
//! no header and no checksum:
//!
//! ```text
//! +-----------+-----------+-------------+-------------+-------------+
//! | start (8) |  end (8)  | file key(2) |  offset (4) |   size (4)  |
//! +-----------+-----------+-------------+-------------+-------------+
//! ```
//!
//! Flushes only rewrite the dirty suffix of the index, starting at a record
//! boundary, so a crash leaves each record either fully old or fully new.

use super::Pointer;
use crate::error::IoContext;
use crate::types::TimeRange;
use crate::{DomainError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of one encoded pointer record
pub(crate) const RECORD_SIZE: usize = 26;

pub(crate) fn encode_pointer(pointer: &Pointer, buf: &mut BytesMut) {
    buf.put_i64_le(pointer.time_range.start);
    buf.put_i64_le(pointer.time_range.end);
    buf.put_u16_le(pointer.file_key);
    buf.put_u32_le(pointer.offset);
    buf.put_u32_le(pointer.size);
}

/// Decode one record. The caller guarantees `RECORD_SIZE` bytes remain.
pub(crate) fn decode_pointer<B: Buf>(buf: &mut B) -> Pointer {
    let start = buf.get_i64_le();
    let end = buf.get_i64_le();
    let file_key = buf.get_u16_le();
    let offset = buf.get_u32_le();
    let size = buf.get_u32_le();
    Pointer::new(TimeRange::new(start, end), file_key, offset, size)
}

/// Durable backing file for the index
pub(crate) struct IndexPersist {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl IndexPersist {
    /// Open or create the index file
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .context("open index file", path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Read every record in the file
    pub fn load(&self) -> Result<Vec<Pointer>> {
        let mut file = self.file.lock();
        let mut data = Vec::new();
        file.seek(SeekFrom::Start(0))
            .context("seek index file", &self.path)?;
        file.read_to_end(&mut data)
            .context("read index file", &self.path)?;

        if data.len() % RECORD_SIZE != 0 {
            return Err(DomainError::Corruption(format!(
                "index file {:?} has length {} which is not a multiple of {}",
                self.path,
                data.len(),
                RECORD_SIZE
            )));
        }

        let mut buf = Bytes::from(data);
        let mut pointers = Vec::with_capacity(buf.len() / RECORD_SIZE);
        while buf.has_remaining() {
            pointers.push(decode_pointer(&mut buf));
        }
        Ok(pointers)
    }

    /// Encode `pointers[start..]` and return the flush that writes it.
    ///
    /// Encoding happens immediately, so the caller can hold the index lock
    /// while preparing and release it before running the returned closure.
    pub fn prepare(
        &self,
        pointers: &[Pointer],
        start: usize,
    ) -> impl FnOnce() -> Result<()> + Send + 'static {
        let start = start.min(pointers.len());
        let total = pointers.len();
        let mut buf = BytesMut::with_capacity((total - start) * RECORD_SIZE);
        for pointer in &pointers[start..] {
            encode_pointer(pointer, &mut buf);
        }
        let encoded = buf.freeze();
        let file = Arc::clone(&self.file);
        let path = self.path.clone();

        move || {
            let mut file = file.lock();
            file.set_len((total * RECORD_SIZE) as u64)
                .context("truncate index file", &path)?;
            file.seek(SeekFrom::Start((start * RECORD_SIZE) as u64))
                .context("seek index file", &path)?;
            file.write_all(&encoded)
                .context("write index file", &path)?;
            file.sync_data().context("sync index file", &path)?;
            Ok(())
        }
    }
}
