//! Error types for SegDB

use crate::types::TimeRange;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for SegDB operations
pub type Result<T> = std::result::Result<T, DomainError>;

/// SegDB error types
#[derive(Error, Debug)]
pub enum DomainError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem operation failed on a known path
    #[error("failed to {op} {path:?}: {source}")]
    FileSystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A domain overlaps one that is already stored
    #[error("write conflict: {incoming} overlaps existing domain {existing} (intersection {intersection})")]
    WriteConflict {
        existing: TimeRange,
        incoming: TimeRange,
        intersection: TimeRange,
    },

    /// No domain covers the requested range
    #[error("range not found: {0}")]
    RangeNotFound(TimeRange),

    /// Operation on a closed resource
    #[error("resource closed: {0}")]
    ResourceClosed(&'static str),

    /// A handle is checked out elsewhere
    #[error("resource in use: {0}")]
    ResourceInUse(String),

    /// Close refused while writers or iterators are still open
    #[error("cannot close database: {count} open writers/iterators")]
    OpenResources { count: usize },

    /// Invalid arguments or call ordering
    #[error("validation error: {0}")]
    Validation(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Internal invariant violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Several errors raised by one operation
    #[error("{}", join_errors(.0))]
    Multiple(Vec<DomainError>),
}

fn join_errors(errors: &[DomainError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DomainError {
    /// Check if error is a write conflict
    pub fn is_write_conflict(&self) -> bool {
        matches!(self, DomainError::WriteConflict { .. })
    }

    /// Check if error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, DomainError::Validation(_))
    }

    /// Check if error reports a closed resource
    pub fn is_resource_closed(&self) -> bool {
        matches!(self, DomainError::ResourceClosed(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, DomainError::Corruption(_))
    }

    /// Collapse a list of errors into a single result
    pub(crate) fn aggregate(mut errors: Vec<DomainError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DomainError::Multiple(errors)),
        }
    }
}

/// Attach the failing operation and path to an IO error
pub(crate) trait IoContext<T> {
    fn context(self, op: &'static str, path: &Path) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn context(self, op: &'static str, path: &Path) -> Result<T> {
        self.map_err(|source| DomainError::FileSystem {
            op,
            path: path.to_path_buf(),
            source,
        })
    }
}
