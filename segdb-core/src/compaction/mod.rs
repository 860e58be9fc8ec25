//! Garbage collection of deleted domain bytes
//!
//! Deletes only rewrite the index. The bytes they drop stay in their data
//! file, counted as tombstones, until a collection rewrites that file with
//! just the domains still referenced.
//!
//! A collection moves `<key>.domain` aside to `<key>_gc.domain` and copies the
//! live domains into a fresh `<key>.domain` without holding the index lock.
//! The index only learns the new offsets once the copy is on disk, and the
//! aside file is removed once those offsets are flushed.

mod delete;

use crate::error::IoContext;
use crate::file::{data_file_path, gc_file_path, list_gc_files};
use crate::index::{IndexState, Pointer};
use crate::storage::DbInner;
use crate::{DomainError, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Outcome of one garbage collection run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub files_collected: usize,
    pub bytes_reclaimed: u64,
}

/// Where one live domain sat before a collection and where it landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Relocation {
    old_offset: u32,
    size: u32,
    new_offset: u32,
}

/// A data file rewritten without its tombstoned bytes
struct Rewrite {
    relocations: Vec<Relocation>,
    old_len: u64,
    new_len: u64,
}

impl DbInner {
    /// Compact every data file whose tombstones reach the configured share
    /// of the file size cap. Files with checked-out handles are skipped.
    pub(crate) fn garbage_collect(&self) -> Result<GcReport> {
        let _gc = self.gc_lock.lock();

        let threshold = self.config.gc_threshold * self.fc.real_file_size_cap() as f32;
        let mut candidates: Vec<(u16, u64)> = self
            .index
            .tombstones()
            .into_iter()
            .filter(|(_, bytes)| *bytes > 0 && *bytes as f32 >= threshold)
            .collect();
        candidates.sort_unstable();

        let mut report = GcReport::default();
        for (key, tombstones) in candidates {
            debug!("Collecting file {} with {} tombstoned bytes", key, tombstones);
            if let Some(reclaimed) = self.collect_file(key)? {
                report.files_collected += 1;
                report.bytes_reclaimed += reclaimed;
            }
        }

        info!(
            "Garbage collection finished: {} files collected, {} bytes reclaimed",
            report.files_collected, report.bytes_reclaimed
        );
        Ok(report)
    }

    /// Rewrite one file. Returns `None` when the file is in use.
    ///
    /// The index lock is held only to take the file out of circulation and
    /// snapshot its domains, and again to apply their new offsets. Readers of
    /// the file block in the file controller until it is rejuvenated.
    fn collect_file(&self, key: u16) -> Result<Option<u64>> {
        let live: Vec<Pointer> = {
            let state = self.index.write_state();
            match self.fc.begin_collect(key) {
                Ok(()) => {}
                Err(DomainError::ResourceInUse(what)) => {
                    debug!("Skipping collection of file {}: {} is checked out", key, what);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
            state
                .pointers
                .iter()
                .filter(|p| p.file_key == key)
                .copied()
                .collect()
        };

        let dir = &self.config.dir;
        let reclaimed = rewrite_file(dir, key, &live).and_then(|rewrite| {
            let relocated = {
                let mut state = self.index.write_state();
                relocate(&mut state, key, &rewrite.relocations, rewrite.new_len)
            };
            match relocated {
                Ok(()) => {
                    debug!(
                        "Rewrote file {}: {} -> {} bytes",
                        key, rewrite.old_len, rewrite.new_len
                    );
                    Ok(rewrite.old_len.saturating_sub(rewrite.new_len))
                }
                Err(e) => {
                    restore_file(dir, key);
                    Err(e)
                }
            }
        });

        let reclaimed = match reclaimed {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                if let Err(restore) = self.fc.rejuvenate(key) {
                    warn!("Failed to return file {} to the pool: {}", key, restore);
                }
                return Err(e);
            }
        };

        // The old copy stays on disk until the index no longer points into it
        let persisted = self.index.persist();
        if persisted.is_ok() {
            let aside = gc_file_path(dir, key);
            if let Err(e) = fs::remove_file(&aside) {
                warn!("Failed to remove compacted file {:?}: {}", aside, e);
            }
        }
        let rejuvenated = self.fc.rejuvenate(key);
        persisted?;
        rejuvenated?;
        Ok(Some(reclaimed))
    }
}

/// Settle data files left aside by a collection that never finished.
///
/// The compacted file is kept only when the index already describes it, that
/// is when the file's domains in index order fill it from offset 0 without
/// gaps. Otherwise the index still points into the original, which is put
/// back.
pub(crate) fn recover_collections(dir: &Path, pointers: &[Pointer]) -> Result<()> {
    for key in list_gc_files(dir)? {
        let path = data_file_path(dir, key);
        let aside = gc_file_path(dir, key);
        let compacted_len = match fs::metadata(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            other => Some(other.context("stat data file", &path)?.len()),
        };

        if compacted_len.map_or(false, |len| describes_compacted(pointers, key, len)) {
            info!("Completing interrupted collection of file {}", key);
            fs::remove_file(&aside).context("remove compacted file", &aside)?;
        } else {
            warn!("Restoring file {} from interrupted collection", key);
            fs::rename(&aside, &path).context("restore data file", &aside)?;
        }
    }
    Ok(())
}

fn describes_compacted(pointers: &[Pointer], key: u16, len: u64) -> bool {
    let mut offset = 0u64;
    for pointer in pointers.iter().filter(|p| p.file_key == key) {
        if pointer.offset as u64 != offset {
            return false;
        }
        offset += pointer.size as u64;
    }
    offset == len
}

/// Move the file aside and copy `live` into a fresh file in order.
/// Restores the original file on failure.
fn rewrite_file(dir: &Path, key: u16, live: &[Pointer]) -> Result<Rewrite> {
    let path = data_file_path(dir, key);
    let aside = gc_file_path(dir, key);
    let old_len = fs::metadata(&path).context("stat data file", &path)?.len();
    fs::rename(&path, &aside).context("move data file aside", &path)?;

    match copy_live(&aside, &path, live) {
        Ok((relocations, new_len)) => Ok(Rewrite {
            relocations,
            old_len,
            new_len,
        }),
        Err(e) => {
            restore_file(dir, key);
            Err(e)
        }
    }
}

/// Drop a partial compacted file and move the original back
fn restore_file(dir: &Path, key: u16) {
    let path = data_file_path(dir, key);
    let aside = gc_file_path(dir, key);
    if let Err(cleanup) = fs::remove_file(&path) {
        if cleanup.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {:?}: {}", path, cleanup);
        }
    }
    if let Err(restore) = fs::rename(&aside, &path) {
        error!("Failed to restore {:?} from {:?}: {}", path, aside, restore);
    }
}

/// Copy each domain in `live` from `from` into a new file at `to`. Returns
/// where every domain landed and the new file length.
fn copy_live(from: &Path, to: &Path, live: &[Pointer]) -> Result<(Vec<Relocation>, u64)> {
    let mut src = File::open(from).context("open data file", from)?;
    let mut dst = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(to)
        .context("create data file", to)?;

    let mut relocations = Vec::with_capacity(live.len());
    let mut offset = 0u64;
    for pointer in live {
        src.seek(SeekFrom::Start(pointer.offset as u64))
            .context("seek data file", from)?;
        let copied = io::copy(&mut src.by_ref().take(pointer.size as u64), &mut dst)
            .context("copy domain", to)?;
        if copied != pointer.size as u64 {
            return Err(DomainError::Corruption(format!(
                "domain {} is truncated: found {} of {} bytes",
                pointer, copied, pointer.size
            )));
        }
        relocations.push(Relocation {
            old_offset: pointer.offset,
            size: pointer.size,
            new_offset: offset as u32,
        });
        offset += copied;
    }

    dst.sync_all().context("sync data file", to)?;
    Ok((relocations, offset))
}

/// Point every domain in file `key` at its copy in the compacted file.
///
/// A domain may have shrunk since the copy was taken, so each one is found
/// by the copied byte range containing it. Whatever the compacted file holds
/// that no domain references is tombstoned again.
fn relocate(
    state: &mut IndexState,
    key: u16,
    relocations: &[Relocation],
    new_len: u64,
) -> Result<()> {
    let mut by_old = relocations.to_vec();
    by_old.sort_unstable_by_key(|r| (r.old_offset, r.size));

    let mut moves = Vec::new();
    let mut live = 0u64;
    for (pos, pointer) in state.pointers.iter().enumerate() {
        if pointer.file_key != key {
            continue;
        }
        let idx = by_old.partition_point(|r| r.old_offset <= pointer.offset);
        let copy = idx
            .checked_sub(1)
            .map(|i| by_old[i])
            .filter(|r| pointer.end_offset() <= r.old_offset as u64 + r.size as u64)
            .ok_or_else(|| {
                DomainError::Internal(format!(
                    "domain {} was not copied into the compacted file",
                    pointer
                ))
            })?;

        let offset = copy.new_offset + (pointer.offset - copy.old_offset);
        if offset != pointer.offset {
            moves.push((pos, offset));
        }
        live += pointer.size as u64;
    }

    if let Some((first, _)) = moves.first() {
        state.mark_dirty(*first);
    }
    for (pos, offset) in moves {
        state.pointers[pos].offset = offset;
    }

    let dead = new_len.saturating_sub(live);
    if dead > 0 {
        state.tombstones.insert(key, dead);
    } else {
        state.tombstones.remove(&key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::IteratorConfig;
    use crate::storage::{Config, DB};
    use crate::testing::{file_sizes, open_db, read_all};
    use crate::types::{TimeRange, MILLISECOND, SECOND};
    use crate::WriterConfig;
    use tempfile::TempDir;

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(start * SECOND, end * SECOND)
    }

    fn open_eager(dir: &TempDir, file_size: u64) -> DB {
        DB::open(
            Config::new(dir.path())
                .file_size(file_size)
                .gc_threshold(f32::MIN_POSITIVE),
        )
        .unwrap()
    }

    #[test]
    fn test_collect_reclaims_deleted_domain() {
        let dir = TempDir::new().unwrap();
        let db = open_eager(&dir, 1024);
        db.write(range(0, 10), &[1; 10]).unwrap();
        db.write(range(10, 20), &[2; 10]).unwrap();
        db.write(range(20, 30), &[3; 10]).unwrap();

        db.delete(1, 1, 0, 10, range(10, 20)).unwrap();
        assert_eq!(db.stats().unwrap().tombstone_bytes, 10);
        assert_eq!(file_sizes(&dir)[&1], 30);

        let report = db.garbage_collect().unwrap();
        assert_eq!(
            report,
            GcReport {
                files_collected: 1,
                bytes_reclaimed: 10
            }
        );
        assert_eq!(file_sizes(&dir)[&1], 20);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 0);
        assert!(!dir.path().join("1_gc.domain").exists());

        let mut expected = vec![1; 10];
        expected.extend_from_slice(&[3; 10]);
        assert_eq!(read_all(&db, TimeRange::MAX), expected);

        // The compacted file keeps accepting writes
        db.write(range(30, 40), &[4; 5]).unwrap();
        assert_eq!(file_sizes(&dir)[&1], 25);
        expected.extend_from_slice(&[4; 5]);
        assert_eq!(read_all(&db, TimeRange::MAX), expected);

        // Nothing left to collect
        assert_eq!(db.garbage_collect().unwrap(), GcReport::default());
    }

    #[test]
    fn test_delete_inside_domain_then_collect() {
        let dir = TempDir::new().unwrap();
        let db = open_eager(&dir, 9);
        let data: Vec<u8> = (10..20).collect();
        db.write(range(10, 20), &data).unwrap();

        db.delete(0, 0, 3, 7, range(13, 17)).unwrap();

        let mut iter = db.open_iterator(IteratorConfig::max()).unwrap();
        let mut seen = Vec::new();
        let mut ok = iter.seek_first();
        while ok {
            let mut bytes = Vec::new();
            iter.open_reader().unwrap().read_to_end(&mut bytes).unwrap();
            seen.push((iter.time_range(), bytes));
            ok = iter.next();
        }
        iter.close().unwrap();
        assert_eq!(
            seen,
            vec![
                (range(10, 13), vec![10, 11, 12]),
                (range(17, 20), vec![17, 18, 19]),
            ]
        );

        assert_eq!(file_sizes(&dir)[&1], 10);
        let report = db.garbage_collect().unwrap();
        assert_eq!(report.bytes_reclaimed, 4);
        assert_eq!(file_sizes(&dir)[&1], 6);

        db.write(range(20, 21), &[20]).unwrap();
        assert_eq!(read_all(&db, range(10, 13)), vec![10, 11, 12]);
        assert_eq!(read_all(&db, range(17, 20)), vec![17, 18, 19]);
        assert_eq!(read_all(&db, range(20, 21)), vec![20]);
        db.close().unwrap();
        drop(db);

        let db = open_eager(&dir, 9);
        assert_eq!(read_all(&db, TimeRange::MAX), vec![10, 11, 12, 17, 18, 19, 20]);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 0);
    }

    #[test]
    fn test_threshold_selects_files() {
        let dir = TempDir::new().unwrap();
        // Cap of 5 bytes per file, collect at 2 tombstoned bytes
        let db = DB::open(Config::new(dir.path()).file_size(5).gc_threshold(0.4)).unwrap();
        db.write(range(0, 1), &[1; 5]).unwrap();
        db.write(range(1, 2), &[2; 5]).unwrap();
        db.write(range(2, 3), &[3; 3]).unwrap();
        assert_eq!(
            file_sizes(&dir).into_iter().collect::<Vec<_>>(),
            vec![(1, 5), (2, 5), (3, 3)]
        );

        db.delete(0, 0, 0, 2, TimeRange::new(0, 200 * MILLISECOND))
            .unwrap();
        db.delete(1, 1, 0, 1, TimeRange::new(SECOND, SECOND + 100 * MILLISECOND))
            .unwrap();
        assert_eq!(db.stats().unwrap().tombstone_bytes, 3);

        let report = db.garbage_collect().unwrap();
        assert_eq!(
            report,
            GcReport {
                files_collected: 1,
                bytes_reclaimed: 2
            }
        );
        assert_eq!(
            file_sizes(&dir).into_iter().collect::<Vec<_>>(),
            vec![(1, 3), (2, 5), (3, 3)]
        );
        assert_eq!(db.stats().unwrap().tombstone_bytes, 1);

        let mut expected = vec![1; 3];
        expected.extend_from_slice(&[2; 4]);
        expected.extend_from_slice(&[3; 3]);
        assert_eq!(read_all(&db, TimeRange::MAX), expected);
    }

    #[test]
    fn test_emptied_file_is_reused() {
        let dir = TempDir::new().unwrap();
        // Cap of 3 bytes per file
        let db = DB::open(Config::new(dir.path()).file_size(2)).unwrap();
        db.write(range(0, 1), &[1; 3]).unwrap();
        db.write(range(1, 2), &[2; 3]).unwrap();
        assert_eq!(file_sizes(&dir).len(), 2);

        db.delete(1, 1, 0, 3, range(1, 2)).unwrap();
        let report = db.garbage_collect().unwrap();
        assert_eq!(report.files_collected, 1);
        assert_eq!(file_sizes(&dir)[&2], 0);

        db.write(range(2, 3), &[3]).unwrap();
        assert_eq!(
            file_sizes(&dir).into_iter().collect::<Vec<_>>(),
            vec![(1, 3), (2, 1)]
        );
        let mut expected = vec![1; 3];
        expected.push(3);
        assert_eq!(read_all(&db, TimeRange::MAX), expected);
    }

    #[test]
    fn test_tombstones_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_eager(&dir, 1024);
            db.write(range(0, 10), &[1; 8]).unwrap();
            db.write(range(10, 20), &[2; 4]).unwrap();
            db.delete(0, 0, 0, 8, range(0, 10)).unwrap();
            db.close().unwrap();
        }

        let db = open_eager(&dir, 1024);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 8);
        let report = db.garbage_collect().unwrap();
        assert_eq!(report.bytes_reclaimed, 8);
        assert_eq!(read_all(&db, TimeRange::MAX), vec![2; 4]);
    }

    #[test]
    fn test_skips_files_in_use() {
        let dir = TempDir::new().unwrap();
        let db = open_eager(&dir, 1024);
        db.write(range(0, 10), &[1; 8]).unwrap();
        db.write(range(10, 20), &[2; 8]).unwrap();
        db.delete(0, 0, 0, 8, range(0, 10)).unwrap();

        let mut iter = db.open_iterator(IteratorConfig::max()).unwrap();
        assert!(iter.seek_first());
        let reader = iter.open_reader().unwrap();
        assert_eq!(db.garbage_collect().unwrap().files_collected, 0);
        drop(reader);

        let mut writer = db.open_writer(WriterConfig::new(20 * SECOND)).unwrap();
        writer.write(&[3; 2]).unwrap();
        assert_eq!(db.garbage_collect().unwrap().files_collected, 0);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 8);
        writer.commit(21 * SECOND).unwrap();
        writer.close().unwrap();

        assert_eq!(db.garbage_collect().unwrap().files_collected, 1);
        let mut expected = vec![2; 8];
        expected.extend_from_slice(&[3; 2]);
        assert_eq!(read_all(&db, TimeRange::MAX), expected);
        iter.close().unwrap();
    }

    #[test]
    fn test_iterator_follows_moved_domain() {
        let dir = TempDir::new().unwrap();
        let db = open_eager(&dir, 1024);
        db.write(range(0, 10), &[1; 8]).unwrap();
        db.write(range(10, 20), b"moved").unwrap();

        let mut iter = db.open_iterator(IteratorConfig::new(range(10, 20))).unwrap();
        assert!(iter.seek_first());
        assert_eq!(iter.pointer().unwrap().offset, 8);

        db.delete(0, 0, 0, 8, range(0, 10)).unwrap();
        db.garbage_collect().unwrap();

        let mut data = Vec::new();
        iter.open_reader().unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"moved");
    }

    #[test]
    fn test_truncated_file_is_restored() {
        let dir = TempDir::new().unwrap();
        let db = open_eager(&dir, 1024);
        db.write(range(0, 10), &[1; 10]).unwrap();
        db.write(range(10, 20), &[2; 10]).unwrap();
        db.delete(0, 0, 0, 10, range(0, 10)).unwrap();

        OpenOptions::new()
            .write(true)
            .open(dir.path().join("1.domain"))
            .unwrap()
            .set_len(15)
            .unwrap();

        assert!(db.garbage_collect().unwrap_err().is_corruption());
        assert_eq!(file_sizes(&dir)[&1], 15);
        assert!(!dir.path().join("1_gc.domain").exists());
        assert_eq!(db.stats().unwrap().tombstone_bytes, 10);
    }

    #[test]
    fn test_delete_out_of_range() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir, 1024);
        db.write(range(0, 10), &[1; 10]).unwrap();
        assert!(db.delete(0, 1, 0, 0, range(0, 10)).unwrap_err().is_validation());
        assert!(db.delete(0, 0, 4, 2, range(4, 6)).unwrap_err().is_validation());
        assert_eq!(read_all(&db, TimeRange::MAX), vec![1; 10]);
    }

    #[test]
    fn test_rejected_delete_leaves_database_reopenable() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (10..20).collect();
        {
            let db = open_db(&dir, 1024);
            db.write(range(10, 20), &data).unwrap();
            let err = db.delete(0, 0, 3, 7, range(17, 13)).unwrap_err();
            assert!(err.is_validation());
            assert!(db.delete(0, 0, 3, 10, range(13, 25)).unwrap_err().is_validation());
            assert!(db.has_data_for(range(14, 15)).unwrap());
            db.close().unwrap();
        }

        let db = open_db(&dir, 1024);
        assert_eq!(read_all(&db, TimeRange::MAX), data);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 0);
    }

    #[test]
    fn test_reopen_after_delete() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (10..20).collect();
        {
            let db = open_db(&dir, 1024);
            db.write(range(10, 20), &data).unwrap();
            db.write(range(20, 30), &[7; 4]).unwrap();
            db.delete(0, 1, 3, 1, range(13, 21)).unwrap();
            db.close().unwrap();
        }

        let db = open_db(&dir, 1024);
        assert_eq!(db.stats().unwrap().domains, 2);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 8);
        assert!(!db.has_data_for(range(13, 21)).unwrap());
        assert_eq!(read_all(&db, range(10, 13)), vec![10, 11, 12]);
        assert_eq!(read_all(&db, range(21, 30)), vec![7; 3]);
    }

    #[test]
    fn test_relocate_follows_shrunk_domains() {
        let pointer = |start: i64, end: i64, key: u16, offset: u32, size: u32| {
            Pointer::new(range(start, end), key, offset, size)
        };
        // File 1 held 8 dead bytes, then A at 8 and B at 18. A was split and B
        // removed after the copy was taken.
        let mut state = IndexState {
            pointers: vec![
                pointer(0, 3, 1, 8, 3),
                pointer(7, 10, 1, 15, 3),
                pointer(20, 30, 2, 0, 4),
            ],
            ..Default::default()
        };
        state.tombstones.insert(1, 18);
        state.tombstones.insert(2, 1);
        let relocations = [
            Relocation {
                old_offset: 8,
                size: 10,
                new_offset: 0,
            },
            Relocation {
                old_offset: 18,
                size: 6,
                new_offset: 10,
            },
        ];

        relocate(&mut state, 1, &relocations, 16).unwrap();
        assert_eq!(
            state.pointers,
            vec![
                pointer(0, 3, 1, 0, 3),
                pointer(7, 10, 1, 7, 3),
                pointer(20, 30, 2, 0, 4),
            ]
        );
        assert_eq!(state.tombstones[&1], 10);
        assert_eq!(state.tombstones[&2], 1);
        assert_eq!(state.persist_head, Some(0));

        // Nothing copied covers a domain that grew
        state.pointers[0].size = 12;
        assert!(relocate(&mut state, 1, &relocations, 16).is_err());
    }

    #[test]
    fn test_index_stays_readable_during_copy() {
        let dir = TempDir::new().unwrap();
        let db = open_eager(&dir, 1024);
        db.write(range(0, 10), &[1; 10]).unwrap();
        db.write(range(10, 20), &[2; 10]).unwrap();
        db.delete(0, 0, 0, 10, range(0, 10)).unwrap();

        // Collection takes the file out of circulation, then copies unlocked
        let live = {
            let state = db.inner.index.write_state();
            db.inner.fc.begin_collect(1).unwrap();
            state.pointers.clone()
        };
        let rewrite = rewrite_file(dir.path(), 1, &live).unwrap();
        assert!(db.has_data_for(range(12, 13)).unwrap());
        assert_eq!(db.time_range().unwrap(), Some(range(10, 20)));

        relocate(&mut db.inner.index.write_state(), 1, &rewrite.relocations, rewrite.new_len)
            .unwrap();
        db.inner.index.persist().unwrap();
        fs::remove_file(gc_file_path(dir.path(), 1)).unwrap();
        db.inner.fc.rejuvenate(1).unwrap();

        assert_eq!(read_all(&db, TimeRange::MAX), vec![2; 10]);
        assert_eq!(file_sizes(&dir)[&1], 10);
    }

    #[test]
    fn test_interrupted_collection_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_eager(&dir, 1024);
            db.write(range(0, 10), &[1; 8]).unwrap();
            db.write(range(10, 20), &[2; 4]).unwrap();
            db.delete(0, 0, 0, 8, range(0, 10)).unwrap();
            db.close().unwrap();
        }

        // Compacted copy on disk, index never flushed
        let path = dir.path().join("1.domain");
        fs::rename(&path, dir.path().join("1_gc.domain")).unwrap();
        fs::write(&path, [2u8; 4]).unwrap();

        let db = open_eager(&dir, 1024);
        assert!(!dir.path().join("1_gc.domain").exists());
        assert_eq!(file_sizes(&dir)[&1], 12);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 8);
        assert_eq!(read_all(&db, TimeRange::MAX), vec![2; 4]);

        assert_eq!(db.garbage_collect().unwrap().bytes_reclaimed, 8);
        assert_eq!(read_all(&db, TimeRange::MAX), vec![2; 4]);
    }

    #[test]
    fn test_file_moved_aside_is_restored() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_db(&dir, 1024);
            db.write(range(0, 10), &[1; 8]).unwrap();
            db.close().unwrap();
        }

        fs::rename(dir.path().join("1.domain"), dir.path().join("1_gc.domain")).unwrap();

        let db = open_db(&dir, 1024);
        assert!(!dir.path().join("1_gc.domain").exists());
        assert_eq!(read_all(&db, TimeRange::MAX), vec![1; 8]);
    }

    #[test]
    fn test_finished_collection_drops_aside_copy() {
        let dir = TempDir::new().unwrap();
        {
            let db = open_eager(&dir, 1024);
            db.write(range(0, 10), &[1; 8]).unwrap();
            db.write(range(10, 20), &[2; 4]).unwrap();
            db.delete(0, 0, 0, 8, range(0, 10)).unwrap();
            db.garbage_collect().unwrap();
            db.close().unwrap();
        }

        // Index already flushed, aside copy never removed
        fs::write(dir.path().join("1_gc.domain"), [9u8; 12]).unwrap();

        let db = open_eager(&dir, 1024);
        assert!(!dir.path().join("1_gc.domain").exists());
        assert_eq!(file_sizes(&dir)[&1], 4);
        assert_eq!(db.stats().unwrap().tombstone_bytes, 0);
        assert_eq!(read_all(&db, TimeRange::MAX), vec![2; 4]);
    }
}
