//! Domain iterator and reader
//!
//! Iterators walk the index by position rather than over a snapshot, so
//! commits made while iterating may shift which domain a position refers to.

use crate::file::ReaderHandle;
use crate::index::Pointer;
use crate::storage::{DbInner, ResourceToken};
use crate::types::{TimeRange, Timestamp};
use crate::{DomainError, Result};
use std::io;
use std::sync::Arc;

/// Iterator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorConfig {
    /// Only domains overlapping these bounds are visited
    pub bounds: TimeRange,
}

impl IteratorConfig {
    pub fn new(bounds: TimeRange) -> Self {
        Self { bounds }
    }

    /// Visit every domain
    pub fn max() -> Self {
        Self::new(TimeRange::MAX)
    }
}

/// Cursor over the domains overlapping a time range
pub struct DomainIterator {
    db: Arc<DbInner>,
    token: Option<ResourceToken>,
    bounds: TimeRange,
    position: Option<usize>,
    value: Option<Pointer>,
    valid: bool,
}

impl DomainIterator {
    pub(crate) fn open(db: Arc<DbInner>, config: IteratorConfig) -> Result<Self> {
        let token = db.register()?;
        Ok(Self {
            db,
            token: Some(token),
            bounds: config.bounds,
            position: None,
            value: None,
            valid: false,
        })
    }

    pub fn bounds(&self) -> TimeRange {
        self.bounds
    }

    /// Move to the first domain within bounds
    pub fn seek_first(&mut self) -> bool {
        self.seek_ge(self.bounds.start)
    }

    /// Move to the last domain within bounds
    pub fn seek_last(&mut self) -> bool {
        self.seek_le(self.bounds.end.saturating_sub(1))
    }

    /// Move to the domain containing `ts`, or the first one after it
    pub fn seek_ge(&mut self, ts: Timestamp) -> bool {
        if self.token.is_none() {
            return false;
        }
        let found = self.db.index.search_ge(ts);
        self.settle(found)
    }

    /// Move to the domain containing `ts`, or the last one before it
    pub fn seek_le(&mut self, ts: Timestamp) -> bool {
        if self.token.is_none() {
            return false;
        }
        let found = self.db.index.search_le(ts);
        self.settle(found)
    }

    /// Step to the next domain. On failure the cursor stays where it was.
    pub fn next(&mut self) -> bool {
        let Some(pos) = self.position.filter(|_| self.token.is_some()) else {
            return false;
        };
        let found = self.db.index.get(pos + 1).map(|p| (pos + 1, p));
        self.settle(found)
    }

    /// Step to the previous domain. On failure the cursor stays where it was.
    pub fn prev(&mut self) -> bool {
        let Some(pos) = self.position.filter(|_| self.token.is_some()) else {
            return false;
        };
        let found = pos
            .checked_sub(1)
            .and_then(|prev| self.db.index.get(prev).map(|p| (prev, p)));
        self.settle(found)
    }

    fn settle(&mut self, found: Option<(usize, Pointer)>) -> bool {
        match found {
            Some((pos, pointer)) if pointer.time_range.overlaps_with(&self.bounds) => {
                self.position = Some(pos);
                self.value = Some(pointer);
                self.valid = true;
            }
            _ => self.valid = false,
        }
        self.valid
    }

    pub fn valid(&self) -> bool {
        self.valid && self.token.is_some()
    }

    /// Time range of the current domain
    pub fn time_range(&self) -> TimeRange {
        self.value.map(|p| p.time_range).unwrap_or_default()
    }

    /// Size in bytes of the current domain
    pub fn size(&self) -> u64 {
        self.value.map_or(0, |p| p.size as u64)
    }

    /// Index position of the current domain
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn pointer(&self) -> Option<Pointer> {
        self.value
    }

    /// Open a reader over the bytes of the current domain
    pub fn open_reader(&self) -> Result<Reader> {
        if self.token.is_none() {
            return Err(DomainError::ResourceClosed("domain.iterator"));
        }
        let cached = self
            .value
            .filter(|_| self.valid)
            .ok_or(DomainError::RangeNotFound(self.bounds))?;

        // Holding the handle keeps GC off the file, after which the pointer
        // is looked up again in case an earlier compaction moved it
        let handle = self.db.fc.acquire_reader(cached.file_key)?;
        let current = self
            .db
            .index
            .get_ge(cached.time_range.start)
            .filter(|p| {
                p.time_range.start == cached.time_range.start && p.file_key == cached.file_key
            })
            .ok_or(DomainError::RangeNotFound(cached.time_range))?;

        Ok(Reader {
            handle: Some(handle),
            offset: current.offset as u64,
            size: current.size as u64,
            cursor: 0,
        })
    }

    /// Release the iterator. The cursor is invalid from then on.
    pub fn close(&mut self) -> Result<()> {
        self.token.take();
        self.valid = false;
        Ok(())
    }
}

/// Reads the bytes of a single domain
pub struct Reader {
    handle: Option<ReaderHandle>,
    offset: u64,
    size: u64,
    cursor: u64,
}

impl Reader {
    /// Size of the domain in bytes
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Read from `off` bytes into the domain. Returns 0 at the end.
    pub fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        let handle = self
            .handle
            .as_mut()
            .ok_or(DomainError::ResourceClosed("domain.reader"))?;
        if off >= self.size {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(self.size - off) as usize;
        handle.read_at(&mut buf[..n], self.offset + off)
    }

    /// Return the file handle to the pool
    pub fn close(&mut self) -> Result<()> {
        self.handle.take();
        Ok(())
    }
}

impl io::Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .read_at(buf, self.cursor)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.cursor += n as u64;
        Ok(n)
    }
}
