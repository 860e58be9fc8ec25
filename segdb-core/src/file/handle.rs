//! Checked-out file handles
//!
//! Both handle types own their OS file while checked out and give it back to
//! the [`FileController`] pool when dropped.

use super::FileController;
use crate::error::IoContext;
use crate::{DomainError, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Exclusive append handle on one data file
pub(crate) struct WriterHandle {
    controller: Arc<FileController>,
    key: u16,
    file: Option<File>,
    /// File length when the handle was checked out
    offset: u64,
    written: u64,
}

impl WriterHandle {
    pub(super) fn new(controller: Arc<FileController>, key: u16, file: File, offset: u64) -> Self {
        Self {
            controller,
            key,
            file: Some(file),
            offset,
            written: 0,
        }
    }

    pub fn key(&self) -> u16 {
        self.key
    }

    /// Where the bytes written through this handle begin
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes appended through this handle
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Current length of the underlying file
    pub fn file_len(&self) -> u64 {
        self.offset + self.written
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or(DomainError::ResourceClosed("domain.file_handle"))?;
        file.write_all(data)
            .context("write data file", &self.controller.path_for(self.key))?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    /// Flush written bytes to stable storage
    pub fn sync(&self) -> Result<()> {
        if let Some(file) = &self.file {
            file.sync_data()
                .context("sync data file", &self.controller.path_for(self.key))?;
        }
        Ok(())
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.controller.release_writer(self.key, file);
        }
    }
}

/// Shared-read handle on one data file
pub(crate) struct ReaderHandle {
    controller: Arc<FileController>,
    key: u16,
    file: Option<File>,
}

impl ReaderHandle {
    pub(super) fn new(controller: Arc<FileController>, key: u16, file: File) -> Self {
        Self {
            controller,
            key,
            file: Some(file),
        }
    }

    /// Read into `buf` starting at absolute file offset `offset`, stopping
    /// early only at end of file
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let path = self.controller.path_for(self.key);
        let file = self
            .file
            .as_mut()
            .ok_or(DomainError::ResourceClosed("domain.file_handle"))?;
        file.seek(SeekFrom::Start(offset))
            .context("seek data file", &path)?;

        let mut read = 0;
        while read < buf.len() {
            match file.read(&mut buf[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("read data file", &path),
            }
        }
        Ok(read)
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.controller.release_reader(self.key, file);
        }
    }
}
