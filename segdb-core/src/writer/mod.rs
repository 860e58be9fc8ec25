//! Domain writer
//!
//! A writer appends bytes to one data file and commits them as a domain
//! starting at `start`. Repeated commits extend the same domain. Once the
//! data file reaches its size cap, the writer closes the domain at the commit
//! timestamp and continues with a new domain starting there, in whichever
//! file the controller hands out on the next write.

use crate::file::WriterHandle;
use crate::index::Pointer;
use crate::storage::{DbInner, ResourceToken};
use crate::types::{format_timestamp, TimeRange, Timestamp};
use crate::{DomainError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often committed domains are flushed to the on-disk index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistInterval {
    /// Flush on every commit
    Always,
    /// Flush on the first commit after the interval has elapsed
    Every(Duration),
}

impl Default for PersistInterval {
    fn default() -> Self {
        PersistInterval::Every(crate::config::INDEX_PERSIST_INTERVAL)
    }
}

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Start of the first domain written
    pub start: Timestamp,
    /// Optional upper bound no commit may exceed
    pub end: Option<Timestamp>,
    /// Defer index flushes to `auto_index_persist_interval`. When disabled
    /// every commit is flushed.
    pub enable_auto_commit: bool,
    pub auto_index_persist_interval: PersistInterval,
}

impl WriterConfig {
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            end: None,
            enable_auto_commit: false,
            auto_index_persist_interval: PersistInterval::default(),
        }
    }

    /// Preset the end of the domain
    pub fn end(mut self, end: Timestamp) -> Self {
        self.end = Some(end);
        self
    }

    /// Enable auto-commit with the given index flush interval
    pub fn auto_commit(mut self, interval: PersistInterval) -> Self {
        self.enable_auto_commit = true;
        self.auto_index_persist_interval = interval;
        self
    }

    /// Range the writer claims when opened
    pub fn domain(&self) -> TimeRange {
        TimeRange::new(self.start, self.end.unwrap_or(self.start))
    }

    fn validate(&self) -> Result<()> {
        if let Some(end) = self.end {
            if end <= self.start {
                return Err(DomainError::Validation(format!(
                    "writer end {} must be after start {}",
                    format_timestamp(end),
                    format_timestamp(self.start)
                )));
            }
        }
        Ok(())
    }

    fn persist_interval(&self) -> Option<Duration> {
        if !self.enable_auto_commit {
            return None;
        }
        match self.auto_index_persist_interval {
            PersistInterval::Every(interval) if !interval.is_zero() => Some(interval),
            _ => None,
        }
    }
}

/// Appends bytes to a domain and commits its boundaries into the index
pub struct Writer {
    db: Arc<DbInner>,
    token: Option<ResourceToken>,
    config: WriterConfig,
    /// Start of the domain currently being written
    start: Timestamp,
    handle: Option<WriterHandle>,
    prev_commit: Option<Timestamp>,
    /// Bytes of the current domain covered by the last commit
    committed: u64,
    last_persist: Instant,
    /// Committed to the index but not yet flushed
    dirty: bool,
}

impl Writer {
    pub(crate) fn open(db: Arc<DbInner>, config: WriterConfig) -> Result<Self> {
        config.validate()?;
        let token = db.register()?;

        let domain = config.domain();
        if let Some(existing) = db.index.overlap(&domain) {
            return Err(DomainError::WriteConflict {
                existing: existing.time_range,
                incoming: domain,
                intersection: existing.time_range.intersection(&domain),
            });
        }

        let handle = db.fc.acquire_writer()?;
        debug!(
            "Opened writer at {} on file {}",
            format_timestamp(config.start),
            handle.key()
        );

        Ok(Self {
            start: config.start,
            db,
            token: Some(token),
            config,
            handle: Some(handle),
            prev_commit: None,
            committed: 0,
            last_persist: Instant::now(),
            dirty: false,
        })
    }

    /// Append bytes to the current domain
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        if self.handle.is_none() {
            self.handle = Some(self.db.fc.acquire_writer()?);
        }
        match self.handle.as_mut() {
            Some(handle) => handle.write(data),
            None => Err(DomainError::Internal(
                "writer has no data file handle".to_string(),
            )),
        }
    }

    /// Bytes written to the current domain
    pub fn len(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.written())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commit everything written so far as the domain `[start, end)`
    pub fn commit(&mut self, end: Timestamp) -> Result<()> {
        self.ensure_open()?;

        if let Some(preset) = self.config.end {
            if end > preset {
                return Err(DomainError::Validation(format!(
                    "commit timestamp {} cannot be greater than preset end timestamp {} (exceeds by {}ns)",
                    format_timestamp(end),
                    format_timestamp(preset),
                    end - preset
                )));
            }
        }

        let Some(handle) = self.handle.as_ref() else {
            return Ok(());
        };
        let len = handle.written();
        if len == 0 {
            return Ok(());
        }
        let key = handle.key();
        let offset = handle.offset();
        let file_len = handle.file_len();

        if end <= self.start {
            return Err(DomainError::Validation(format!(
                "commit timestamp {} must be strictly greater than domain start {}",
                format_timestamp(end),
                format_timestamp(self.start)
            )));
        }
        if let Some(prev) = self.prev_commit {
            if end < prev {
                return Err(DomainError::Validation(format!(
                    "commit timestamp {} is before the previous commit {}",
                    format_timestamp(end),
                    format_timestamp(prev)
                )));
            }
        }

        let (offset, size) = match (u32::try_from(offset), u32::try_from(len)) {
            (Ok(offset), Ok(size)) => (offset, size),
            _ => {
                return Err(DomainError::Validation(format!(
                    "domain of {} bytes at offset {} in file {} is not addressable",
                    len, offset, key
                )))
            }
        };

        let oversize = file_len >= self.db.fc.real_file_size_cap();
        let range_end = if oversize {
            end
        } else {
            self.config.end.unwrap_or(end)
        };
        let pointer = Pointer::new(TimeRange::new(self.start, range_end), key, offset, size);

        let persist = match self.config.persist_interval() {
            None => true,
            Some(interval) => self.last_persist.elapsed() >= interval,
        };
        if persist {
            handle.sync()?;
        }

        if self.prev_commit.is_none() {
            self.db.index.insert(pointer, persist)?;
        } else {
            self.db.index.update(pointer, persist)?;
        }

        if persist {
            self.last_persist = Instant::now();
            self.dirty = false;
        } else {
            self.dirty = true;
        }
        self.prev_commit = Some(end);
        self.committed = len;

        if oversize {
            self.rotate(end)?;
        }
        Ok(())
    }

    /// Release the full data file and start a new domain at `end`. The next
    /// write picks up a fresh file.
    fn rotate(&mut self, end: Timestamp) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            debug!(
                "File {} reached {} bytes, rotating writer",
                handle.key(),
                handle.file_len()
            );
            if self.dirty {
                handle.sync()?;
            }
        }
        self.start = end;
        self.prev_commit = None;
        self.committed = 0;
        Ok(())
    }

    /// Flush pending index state and release the file handle
    pub fn close(&mut self) -> Result<()> {
        let Some(token) = self.token.take() else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Some(handle) = self.handle.take() {
            let uncommitted = handle.written().saturating_sub(self.committed);
            self.db.index.add_tombstone(handle.key(), uncommitted);
            if self.dirty {
                if let Err(e) = handle.sync() {
                    errors.push(e);
                }
            }
        }
        if self.dirty {
            if let Err(e) = self.db.index.persist() {
                errors.push(e);
            }
            self.dirty = false;
        }

        drop(token);
        DomainError::aggregate(errors)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.token.is_none() {
            return Err(DomainError::ResourceClosed("domain.writer"));
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close writer on drop: {}", e);
        }
    }
}
