//! Pointer surgery for deletes

use crate::index::{IndexState, Pointer};
use crate::storage::DbInner;
use crate::types::TimeRange;
use crate::{DomainError, Result};
use tracing::debug;

impl DbInner {
    pub(crate) fn delete(
        &self,
        start_pos: usize,
        end_pos: usize,
        start_offset: u64,
        end_offset: u64,
        range: TimeRange,
    ) -> Result<()> {
        // A collection in progress must see its file's pointers unchanged
        let _gc = self.gc_lock.lock();
        {
            let mut state = self.index.write_state();
            delete_pointers(&mut state, start_pos, end_pos, start_offset, end_offset, range)?;
        }
        self.index.persist()
    }
}

/// Replace the pointers in `start_pos..=end_pos` with whatever survives the
/// delete and tombstone the rest
pub(crate) fn delete_pointers(
    state: &mut IndexState,
    start_pos: usize,
    end_pos: usize,
    start_offset: u64,
    end_offset: u64,
    range: TimeRange,
) -> Result<()> {
    let len = state.pointers.len();
    if start_pos > end_pos || end_pos >= len {
        return Err(DomainError::Validation(format!(
            "delete positions {}..={} out of bounds for {} domains",
            start_pos, end_pos, len
        )));
    }

    let first = state.pointers[start_pos];
    let last = state.pointers[end_pos];
    if range.end < range.start {
        return Err(DomainError::Validation(format!(
            "delete range {} ends before it starts",
            range
        )));
    }
    if range.start < first.time_range.start || range.end > last.time_range.end {
        return Err(DomainError::Validation(format!(
            "delete range {} is outside {}",
            range,
            TimeRange::new(first.time_range.start, last.time_range.end)
        )));
    }

    let start_offset = start_offset.min(first.size as u64);
    let end_offset = end_offset.min(last.size as u64);

    if start_pos == end_pos && start_offset > end_offset {
        return Err(DomainError::Validation(format!(
            "delete start offset {} is after end offset {}",
            start_offset, end_offset
        )));
    }

    let mut survivors = Vec::with_capacity(2);
    if start_offset > 0 {
        if range.start <= first.time_range.start {
            return Err(DomainError::Validation(format!(
                "delete keeps {} bytes of {} but starts at or before it",
                start_offset, first.time_range
            )));
        }
        survivors.push(Pointer::new(
            TimeRange::new(first.time_range.start, range.start.min(first.time_range.end)),
            first.file_key,
            first.offset,
            start_offset as u32,
        ));
    }
    if end_offset < last.size as u64 {
        if range.end >= last.time_range.end {
            return Err(DomainError::Validation(format!(
                "delete keeps {} bytes of {} but ends at or after it",
                last.size as u64 - end_offset,
                last.time_range
            )));
        }
        survivors.push(Pointer::new(
            TimeRange::new(range.end.max(last.time_range.start), last.time_range.end),
            last.file_key,
            first_unremoved(&last, end_offset),
            (last.size as u64 - end_offset) as u32,
        ));
    }

    if start_pos == end_pos {
        // Removed head and tail of one pointer overlap, count the gap once
        let removed_tail = first.size as u64 - start_offset;
        let kept_tail = first.size as u64 - end_offset;
        state.add_tombstone(first.file_key, removed_tail - kept_tail);
    } else {
        state.add_tombstone(first.file_key, first.size as u64 - start_offset);
        state.add_tombstone(last.file_key, end_offset);
        for pointer in &state.pointers[start_pos + 1..end_pos] {
            let (key, size) = (pointer.file_key, pointer.size as u64);
            *state.tombstones.entry(key).or_insert(0) += size;
        }
    }

    debug!(
        "Deleted {} from {} domains, {} survive",
        range,
        end_pos - start_pos + 1,
        survivors.len()
    );

    state.pointers.splice(start_pos..=end_pos, survivors);
    state.mark_dirty(start_pos);
    Ok(())
}

fn first_unremoved(pointer: &Pointer, end_offset: u64) -> u32 {
    pointer.offset + end_offset as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SECOND;

    fn pointer(start: i64, end: i64, key: u16, offset: u32, size: u32) -> Pointer {
        Pointer::new(TimeRange::new(start * SECOND, end * SECOND), key, offset, size)
    }

    fn state(pointers: Vec<Pointer>) -> IndexState {
        IndexState {
            pointers,
            ..Default::default()
        }
    }

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(start * SECOND, end * SECOND)
    }

    #[test]
    fn test_delete_middle_of_one_pointer() {
        let mut s = state(vec![pointer(10, 20, 1, 0, 10)]);
        delete_pointers(&mut s, 0, 0, 3, 7, range(13, 17)).unwrap();

        assert_eq!(
            s.pointers,
            vec![pointer(10, 13, 1, 0, 3), pointer(17, 20, 1, 7, 3)]
        );
        assert_eq!(s.tombstones[&1], 4);
        assert_eq!(s.persist_head, Some(0));
    }

    #[test]
    fn test_delete_whole_pointer() {
        let mut s = state(vec![
            pointer(0, 10, 1, 0, 5),
            pointer(10, 20, 1, 5, 10),
            pointer(20, 30, 2, 0, 4),
        ]);
        delete_pointers(&mut s, 1, 1, 0, 10, range(10, 20)).unwrap();

        assert_eq!(
            s.pointers,
            vec![pointer(0, 10, 1, 0, 5), pointer(20, 30, 2, 0, 4)]
        );
        assert_eq!(s.tombstones[&1], 10);
        assert_eq!(s.persist_head, Some(1));
    }

    #[test]
    fn test_delete_across_pointers_and_files() {
        let mut s = state(vec![
            pointer(0, 10, 1, 0, 10),
            pointer(10, 20, 2, 0, 6),
            pointer(20, 30, 3, 0, 8),
            pointer(30, 40, 3, 8, 2),
        ]);
        delete_pointers(&mut s, 0, 2, 4, 5, range(4, 25)).unwrap();

        assert_eq!(
            s.pointers,
            vec![
                pointer(0, 4, 1, 0, 4),
                pointer(25, 30, 3, 5, 3),
                pointer(30, 40, 3, 8, 2),
            ]
        );
        assert_eq!(s.tombstones[&1], 6);
        assert_eq!(s.tombstones[&2], 6);
        assert_eq!(s.tombstones[&3], 5);
    }

    #[test]
    fn test_delete_clamps_offsets() {
        let mut s = state(vec![pointer(0, 10, 1, 0, 10)]);
        delete_pointers(&mut s, 0, 0, 0, 100, range(0, 10)).unwrap();
        assert!(s.pointers.is_empty());
        assert_eq!(s.tombstones[&1], 10);
    }

    #[test]
    fn test_delete_validation() {
        let mut s = state(vec![pointer(0, 10, 1, 0, 10), pointer(10, 20, 1, 10, 10)]);

        assert!(delete_pointers(&mut s, 1, 0, 0, 0, range(0, 1)).is_err());
        assert!(delete_pointers(&mut s, 0, 2, 0, 0, range(0, 1)).is_err());
        assert!(delete_pointers(&mut s, 0, 0, 5, 4, range(5, 6)).is_err());
        // Keeping a prefix requires the delete to start inside the pointer
        assert!(delete_pointers(&mut s, 0, 0, 2, 10, range(0, 10)).is_err());
        // Keeping a suffix requires the delete to end inside the pointer
        assert!(delete_pointers(&mut s, 1, 1, 0, 5, range(10, 20)).is_err());

        assert_eq!(s.pointers.len(), 2);
        assert!(s.tombstones.is_empty());
        assert_eq!(s.persist_head, None);
    }

    #[test]
    fn test_delete_rejects_inverted_range() {
        let original = vec![pointer(10, 20, 1, 0, 10)];
        let mut s = state(original.clone());

        let err = delete_pointers(&mut s, 0, 0, 3, 7, range(17, 13)).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(s.pointers, original);
        assert!(s.tombstones.is_empty());
        assert_eq!(s.persist_head, None);
    }

    #[test]
    fn test_delete_range_must_stay_within_boundary_pointers() {
        let original = vec![pointer(0, 10, 1, 0, 10), pointer(10, 20, 1, 10, 10)];
        let mut s = state(original.clone());

        // Runs past the last pointer while keeping its tail
        assert!(delete_pointers(&mut s, 0, 1, 0, 4, range(0, 25))
            .unwrap_err()
            .is_validation());
        // Runs past the last pointer even though all of it goes
        assert!(delete_pointers(&mut s, 1, 1, 0, 10, range(10, 25))
            .unwrap_err()
            .is_validation());
        // Starts before the first pointer
        assert!(delete_pointers(&mut s, 1, 1, 0, 10, range(5, 20))
            .unwrap_err()
            .is_validation());

        assert_eq!(s.pointers, original);
        assert!(s.tombstones.is_empty());

        // Touching both boundaries exactly is fine
        delete_pointers(&mut s, 0, 1, 0, 10, range(0, 20)).unwrap();
        assert!(s.pointers.is_empty());
        assert_eq!(s.tombstones[&1], 20);
    }

    #[test]
    fn test_delete_survivors_never_overlap() {
        let mut s = state(vec![pointer(10, 20, 1, 0, 10), pointer(20, 30, 2, 0, 10)]);
        delete_pointers(&mut s, 0, 1, 5, 5, range(15, 25)).unwrap();
        delete_pointers(&mut s, 0, 0, 2, 3, range(12, 12)).unwrap();

        assert_eq!(
            s.pointers,
            vec![
                pointer(10, 12, 1, 0, 2),
                pointer(12, 15, 1, 3, 2),
                pointer(25, 30, 2, 5, 5),
            ]
        );
        for pair in s.pointers.windows(2) {
            assert!(pair[0].time_range.end <= pair[1].time_range.start);
        }
    }
}
