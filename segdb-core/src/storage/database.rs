//! DB - owns the index and file controller of one domain database

use super::Config;
use crate::compaction::{recover_collections, GcReport};
use crate::error::IoContext;
use crate::file::{list_data_files, FileController};
use crate::index::Index;
use crate::iterator::{DomainIterator, IteratorConfig};
use crate::writer::{Writer, WriterConfig};
use crate::{DomainError, Result, TimeRange};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// State shared by the database and every open writer and iterator
pub(crate) struct DbInner {
    pub config: Config,
    pub index: Index,
    pub fc: Arc<FileController>,
    pub gc_lock: Mutex<()>,
    open_resources: AtomicUsize,
    closed: RwLock<bool>,
}

impl DbInner {
    /// Register a writer or iterator, failing once the database is closed
    pub fn register(self: &Arc<Self>) -> Result<ResourceToken> {
        let closed = self.closed.read();
        if *closed {
            return Err(DomainError::ResourceClosed("domain.db"));
        }
        self.open_resources.fetch_add(1, Ordering::SeqCst);
        Ok(ResourceToken {
            db: Arc::clone(self),
        })
    }

    /// Keep the database open for the lifetime of the returned guard
    pub fn ensure_open(&self) -> Result<RwLockReadGuard<'_, bool>> {
        let closed = self.closed.read();
        if *closed {
            return Err(DomainError::ResourceClosed("domain.db"));
        }
        Ok(closed)
    }
}

/// Counts one open writer or iterator until dropped
pub(crate) struct ResourceToken {
    db: Arc<DbInner>,
}

impl Drop for ResourceToken {
    fn drop(&mut self) {
        self.db.open_resources.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub domains: usize,
    pub time_range: Option<TimeRange>,
    pub data_files: usize,
    pub data_bytes: u64,
    pub tombstone_bytes: u64,
    pub open_descriptors: usize,
    pub open_resources: usize,
}

/// A domain database rooted at one directory
pub struct DB {
    pub(crate) inner: Arc<DbInner>,
}

impl DB {
    /// Create or open a database
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir).context("create directory", &config.dir)?;

        let index = Index::open(&config.dir)?;
        recover_collections(&config.dir, &index.pointers())?;
        let fc = Arc::new(FileController::open(
            &config.dir,
            config.file_size,
            config.max_descriptors,
        )?);

        // Tombstones are whatever part of each file no pointer references
        let files = list_data_files(&config.dir)?;
        let mut live: HashMap<u16, u64> = HashMap::new();
        for pointer in index.pointers() {
            *live.entry(pointer.file_key).or_insert(0) += pointer.size as u64;
            match files.get(&pointer.file_key) {
                Some(len) if *len >= pointer.end_offset() => {}
                _ => warn!("Domain {} points past the end of its data file", pointer),
            }
        }
        for (key, len) in &files {
            let dead = len.saturating_sub(live.get(key).copied().unwrap_or(0));
            index.add_tombstone(*key, dead);
        }

        info!(
            "Opened domain database {:?}: {} domains in {} data files",
            config.dir,
            index.len(),
            files.len()
        );

        Ok(Self {
            inner: Arc::new(DbInner {
                config,
                index,
                fc,
                gc_lock: Mutex::new(()),
                open_resources: AtomicUsize::new(0),
                closed: RwLock::new(false),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a writer for a new domain starting at `config.start`
    pub fn open_writer(&self, config: WriterConfig) -> Result<Writer> {
        Writer::open(Arc::clone(&self.inner), config)
    }

    /// Open an iterator over the domains overlapping `config.bounds`
    pub fn open_iterator(&self, config: IteratorConfig) -> Result<DomainIterator> {
        DomainIterator::open(Arc::clone(&self.inner), config)
    }

    /// Write `data` as a single domain spanning `range`
    pub fn write(&self, range: TimeRange, data: &[u8]) -> Result<()> {
        let mut writer = self.open_writer(WriterConfig::new(range.start).end(range.end))?;
        writer.write(data)?;
        writer.commit(range.end)?;
        writer.close()
    }

    /// Remove everything between two index positions.
    ///
    /// `start_offset` is the number of bytes kept at the head of the pointer
    /// at `start_pos`, `end_offset` the number of bytes removed from the head
    /// of the pointer at `end_pos`. Kept portions become the domains
    /// `[start.start, range.start)` and `[range.end, end.end)`.
    pub fn delete(
        &self,
        start_pos: usize,
        end_pos: usize,
        start_offset: u64,
        end_offset: u64,
        range: TimeRange,
    ) -> Result<()> {
        let _open = self.inner.ensure_open()?;
        self.inner
            .delete(start_pos, end_pos, start_offset, end_offset, range)
    }

    /// Compact every data file with enough tombstoned bytes
    pub fn garbage_collect(&self) -> Result<GcReport> {
        let _open = self.inner.ensure_open()?;
        self.inner.garbage_collect()
    }

    /// Check if any stored domain overlaps `range`
    pub fn has_data_for(&self, range: TimeRange) -> Result<bool> {
        let _open = self.inner.ensure_open()?;
        Ok(self.inner.index.overlap(&range).is_some())
    }

    /// Range from the start of the first domain to the end of the last
    pub fn time_range(&self) -> Result<Option<TimeRange>> {
        let _open = self.inner.ensure_open()?;
        Ok(self.inner.index.time_range())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let _open = self.inner.ensure_open()?;
        let files = list_data_files(&self.inner.config.dir)?;
        Ok(DbStats {
            domains: self.inner.index.len(),
            time_range: self.inner.index.time_range(),
            data_files: files.len(),
            data_bytes: files.values().sum(),
            tombstone_bytes: self.inner.index.tombstones().values().sum(),
            open_descriptors: self.inner.fc.open_descriptors(),
            open_resources: self.inner.open_resources.load(Ordering::SeqCst),
        })
    }

    /// Close the database.
    ///
    /// Refuses while writers or iterators are open, leaving the database
    /// usable. Closing an already closed database is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.inner.closed.write();
        if *closed {
            return Ok(());
        }
        let count = self.inner.open_resources.load(Ordering::SeqCst);
        if count > 0 {
            return Err(DomainError::OpenResources { count });
        }

        let mut errors = Vec::new();
        if let Err(e) = self.inner.index.persist() {
            errors.push(e);
        }
        if let Err(e) = self.inner.fc.close() {
            errors.push(e);
        }
        self.inner.index.close();
        *closed = true;

        info!("Closed domain database {:?}", self.inner.config.dir);
        DomainError::aggregate(errors)
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        // Best-effort close on drop
        if let Err(e) = self.close() {
            warn!("Failed to close domain database on drop: {}", e);
        }
    }
}
