//! SegDB Core - Segmented Time-Range Storage Engine
//!
//! Stores opaque byte blobs ("domains"), each covering a half-open time range,
//! in a directory of append-only data files described by a sorted index.
//!
//! # Architecture
//!
//! - **Index**: Start-sorted, non-overlapping pointers persisted to `index.domain`
//! - **File controller**: Bounded pool of reader and writer descriptors over the
//!   numbered data files, with size-capped rotation
//! - **Writer**: Streams one domain at a time, committing ranges into the index
//! - **Iterator**: Bidirectional cursor over the domains in a time range
//! - **Compaction**: Deletes tombstone bytes, garbage collection rewrites files
//!   without them

pub mod compaction;
pub mod iterator;
pub mod storage;
pub mod writer;

mod error;
mod file;
mod index;
mod types;

#[cfg(test)]
mod testing;

pub use compaction::GcReport;
pub use error::{DomainError, Result};
pub use index::{Pointer, INDEX_FILE};
pub use iterator::{DomainIterator, IteratorConfig, Reader};
pub use storage::{Config, DbStats, DB};
pub use types::*;
pub use writer::{PersistInterval, Writer, WriterConfig};

/// SegDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Requested data file size (1GB)
    pub const FILE_SIZE: u64 = 1024 * 1024 * 1024;

    /// Share of the file size cap that must be tombstoned before a file is
    /// collected
    pub const GC_THRESHOLD: f32 = 0.2;

    /// Maximum number of open data file descriptors
    pub const MAX_DESCRIPTORS: usize = 100;

    /// Minimum time between index flushes from an auto-committing writer
    pub const INDEX_PERSIST_INTERVAL: Duration = Duration::from_secs(1);
}
