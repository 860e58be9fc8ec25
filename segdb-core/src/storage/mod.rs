//! Storage - database configuration and the top-level coordinator

mod database;

pub use database::{DbStats, DB};

pub(crate) use database::{DbInner, ResourceToken};

use crate::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Domain database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory
    pub dir: PathBuf,
    /// Nominal data file size in bytes before writers move to a new file
    pub file_size: u64,
    /// Fraction of `file_size` that must be tombstoned before a file is
    /// compacted, in `(0, 1]`
    pub gc_threshold: f32,
    /// Maximum number of data file handles open at once
    pub max_descriptors: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            file_size: crate::config::FILE_SIZE,
            gc_threshold: crate::config::GC_THRESHOLD,
            max_descriptors: crate::config::MAX_DESCRIPTORS,
        }
    }
}

impl Config {
    /// Default configuration rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn gc_threshold(mut self, gc_threshold: f32) -> Self {
        self.gc_threshold = gc_threshold;
        self
    }

    pub fn max_descriptors(mut self, max_descriptors: usize) -> Self {
        self.max_descriptors = max_descriptors;
        self
    }

    /// Check every field, reporting the first invalid one
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(DomainError::Validation(
                "config: dir must be provided".to_string(),
            ));
        }
        if self.file_size == 0 {
            return Err(DomainError::Validation(
                "config: file_size must be positive".to_string(),
            ));
        }
        if self.file_size > u32::MAX as u64 {
            return Err(DomainError::Validation(format!(
                "config: file_size {} exceeds the addressable maximum {}",
                self.file_size,
                u32::MAX
            )));
        }
        if !(self.gc_threshold > 0.0 && self.gc_threshold <= 1.0) {
            return Err(DomainError::Validation(format!(
                "config: gc_threshold {} must be in (0, 1]",
                self.gc_threshold
            )));
        }
        if self.max_descriptors == 0 {
            return Err(DomainError::Validation(
                "config: max_descriptors must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
