//! Domain index
//!
//! An in-memory, start-sorted collection of [`Pointer`]s backed by
//! `index.domain`. Time ranges never overlap. Mutations record the earliest
//! touched position so a flush only rewrites the dirty suffix.

mod persist;
mod pointer;

pub use pointer::Pointer;

pub(crate) use persist::RECORD_SIZE;

use crate::types::{TimeRange, Timestamp};
use crate::{DomainError, Result};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use persist::IndexPersist;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error};

/// Name of the index file inside a database directory
pub const INDEX_FILE: &str = "index.domain";

/// Mutable index state guarded by the index lock
#[derive(Debug, Default)]
pub(crate) struct IndexState {
    pub pointers: Vec<Pointer>,
    /// Bytes per data file no longer referenced by any pointer
    pub tombstones: HashMap<u16, u64>,
    /// Earliest position not yet flushed, `None` when clean
    pub persist_head: Option<usize>,
}

impl IndexState {
    /// Record that everything from `pos` onward must be rewritten
    pub fn mark_dirty(&mut self, pos: usize) {
        self.persist_head = Some(self.persist_head.map_or(pos, |head| head.min(pos)));
    }

    pub fn add_tombstone(&mut self, file_key: u16, bytes: u64) {
        if bytes > 0 {
            *self.tombstones.entry(file_key).or_insert(0) += bytes;
        }
    }
}

pub(crate) struct Index {
    state: RwLock<IndexState>,
    persist: IndexPersist,
    flush_lock: Mutex<()>,
}

impl Index {
    /// Open the index stored in `dir`, loading every persisted pointer
    pub fn open(dir: &Path) -> Result<Self> {
        let persist = IndexPersist::open(&dir.join(INDEX_FILE))?;
        let pointers = persist.load()?;

        for pair in pointers.windows(2) {
            if pair[1].time_range.start < pair[0].time_range.end {
                return Err(DomainError::Corruption(format!(
                    "index entries out of order: {} followed by {}",
                    pair[0], pair[1]
                )));
            }
        }

        debug!("Loaded {} index entries from {:?}", pointers.len(), dir);

        Ok(Self {
            state: RwLock::new(IndexState {
                pointers,
                ..Default::default()
            }),
            persist,
            flush_lock: Mutex::new(()),
        })
    }

    /// Add a new pointer, rejecting any overlap with stored domains
    pub fn insert(&self, pointer: Pointer, persist: bool) -> Result<()> {
        validate(&pointer)?;
        {
            let mut state = self.state.write();
            let len = state.pointers.len();

            let append = state
                .pointers
                .last()
                .map_or(true, |last| last.time_range.end <= pointer.time_range.start);

            let pos = if append {
                len
            } else {
                let pos = state
                    .pointers
                    .partition_point(|p| p.time_range.start < pointer.time_range.start);
                if pos > 0 {
                    check_conflict(&state.pointers[pos - 1], &pointer)?;
                }
                if pos < len {
                    check_conflict(&state.pointers[pos], &pointer)?;
                }
                pos
            };

            state.pointers.insert(pos, pointer);
            state.mark_dirty(pos);
        }

        if persist {
            self.persist()?;
        }
        Ok(())
    }

    /// Replace the pointer that starts at `pointer.time_range.start`
    pub fn update(&self, pointer: Pointer, persist: bool) -> Result<()> {
        validate(&pointer)?;
        {
            let mut state = self.state.write();
            let pos = match state
                .pointers
                .binary_search_by_key(&pointer.time_range.start, |p| p.time_range.start)
            {
                Ok(pos) => pos,
                Err(_) => {
                    error!("No index entry starts at {} for update", pointer.time_range);
                    return Err(DomainError::Internal(format!(
                        "cannot update {}: no domain starts at the same timestamp",
                        pointer.time_range
                    )));
                }
            };

            if pos > 0 {
                check_conflict(&state.pointers[pos - 1], &pointer)?;
            }
            if let Some(next) = state.pointers.get(pos + 1) {
                check_conflict(next, &pointer)?;
            }

            state.pointers[pos] = pointer;
            state.mark_dirty(pos);
        }

        if persist {
            self.persist()?;
        }
        Ok(())
    }

    /// Last position whose start is at or before `ts`, and whether that
    /// pointer contains `ts`
    pub fn search(&self, ts: Timestamp) -> (Option<usize>, bool) {
        search(&self.state.read().pointers, ts)
    }

    /// Pointer containing `ts`, or the first one after it
    pub fn search_ge(&self, ts: Timestamp) -> Option<(usize, Pointer)> {
        let state = self.state.read();
        let pos = match search(&state.pointers, ts) {
            (Some(pos), true) => pos,
            (Some(pos), false) => pos + 1,
            (None, _) => 0,
        };
        state.pointers.get(pos).map(|p| (pos, *p))
    }

    /// Pointer containing `ts`, or the last one before it
    pub fn search_le(&self, ts: Timestamp) -> Option<(usize, Pointer)> {
        let state = self.state.read();
        search(&state.pointers, ts)
            .0
            .map(|pos| (pos, state.pointers[pos]))
    }

    pub fn get(&self, pos: usize) -> Option<Pointer> {
        self.state.read().pointers.get(pos).copied()
    }

    pub fn get_ge(&self, ts: Timestamp) -> Option<Pointer> {
        self.search_ge(ts).map(|(_, p)| p)
    }

    /// First stored pointer overlapping `range`
    pub fn overlap(&self, range: &TimeRange) -> Option<Pointer> {
        let state = self.state.read();
        if range.is_zero() {
            return match search(&state.pointers, range.start) {
                (Some(pos), true) => Some(state.pointers[pos]),
                _ => None,
            };
        }
        let pos = state
            .pointers
            .partition_point(|p| p.time_range.start < range.end);
        pos.checked_sub(1)
            .map(|pos| state.pointers[pos])
            .filter(|p| p.time_range.overlaps_with(range))
    }

    /// Range from the first domain's start to the last domain's end
    pub fn time_range(&self) -> Option<TimeRange> {
        let state = self.state.read();
        let first = state.pointers.first()?;
        let last = state.pointers.last()?;
        Some(TimeRange::new(first.time_range.start, last.time_range.end))
    }

    pub fn len(&self) -> usize {
        self.state.read().pointers.len()
    }

    pub fn add_tombstone(&self, file_key: u16, bytes: u64) {
        self.state.write().add_tombstone(file_key, bytes);
    }

    pub fn tombstones(&self) -> HashMap<u16, u64> {
        self.state.read().tombstones.clone()
    }

    pub fn pointers(&self) -> Vec<Pointer> {
        self.state.read().pointers.clone()
    }

    /// Exclusive access for pointer surgery performed by delete and GC
    pub fn write_state(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write()
    }

    /// Flush the dirty suffix to disk.
    ///
    /// The suffix is encoded under the index lock and written after it is
    /// released. Flushes are serialised so an older suffix never lands after a
    /// newer one.
    pub fn persist(&self) -> Result<()> {
        let _flush = self.flush_lock.lock();
        let (head, flush) = {
            let mut state = self.state.write();
            let Some(head) = state.persist_head.take() else {
                return Ok(());
            };
            (head, self.persist.prepare(&state.pointers, head))
        };

        if let Err(e) = flush() {
            self.state.write().mark_dirty(head);
            return Err(e);
        }
        Ok(())
    }

    /// Drop every in-memory pointer. The backing file is left untouched.
    pub fn close(&self) {
        let mut state = self.state.write();
        state.pointers.clear();
        state.tombstones.clear();
        state.persist_head = None;
    }
}

fn search(pointers: &[Pointer], ts: Timestamp) -> (Option<usize>, bool) {
    let idx = pointers.partition_point(|p| p.time_range.start <= ts);
    match idx.checked_sub(1) {
        Some(pos) => (Some(pos), pointers[pos].time_range.contains_stamp(ts)),
        None => (None, false),
    }
}

fn validate(pointer: &Pointer) -> Result<()> {
    if pointer.file_key == 0 {
        error!("Refusing index entry with file key 0: {}", pointer);
        return Err(DomainError::Internal(format!(
            "pointer {} has invalid file key 0",
            pointer.time_range
        )));
    }
    if pointer.time_range.end <= pointer.time_range.start {
        return Err(DomainError::Validation(format!(
            "domain {} has a zero or negative time span",
            pointer.time_range
        )));
    }
    Ok(())
}

fn check_conflict(existing: &Pointer, incoming: &Pointer) -> Result<()> {
    if existing.time_range.overlaps_with(&incoming.time_range) {
        return Err(DomainError::WriteConflict {
            existing: existing.time_range,
            incoming: incoming.time_range,
            intersection: existing.time_range.intersection(&incoming.time_range),
        });
    }
    Ok(())
}
