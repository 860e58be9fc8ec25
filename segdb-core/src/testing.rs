//! Shared helpers for unit tests

use crate::iterator::IteratorConfig;
use crate::storage::{Config, DB};
use crate::types::TimeRange;
use std::collections::BTreeMap;
use std::io::Read;
use tempfile::TempDir;

pub(crate) fn open_db(dir: &TempDir, file_size: u64) -> DB {
    DB::open(Config::new(dir.path()).file_size(file_size)).unwrap()
}

/// Concatenated bytes of every domain overlapping `range`
pub(crate) fn read_all(db: &DB, range: TimeRange) -> Vec<u8> {
    let mut iter = db.open_iterator(IteratorConfig::new(range)).unwrap();
    let mut data = Vec::new();
    let mut ok = iter.seek_first();
    while ok {
        let mut reader = iter.open_reader().unwrap();
        reader.read_to_end(&mut data).unwrap();
        ok = iter.next();
    }
    iter.close().unwrap();
    data
}

/// Sizes of the data files in `dir`, keyed by file key
pub(crate) fn file_sizes(dir: &TempDir) -> BTreeMap<u16, u64> {
    crate::file::list_data_files(dir.path()).unwrap()
}
