//! Commit-time index
//!
//! Maps each distinct commit time to the offset of the first entry carrying
//! it. The file is commit-time ordered, so answering "everything committed
//! after `t`" is a search for the first indexed time greater than `t`
//! followed by a range read up to `total_size`.
//!
//! Entries are only ever appended. A clone shares the underlying vector and
//! remembers its own length, so taking a snapshot is O(1). Appending to a
//! clone first drops anything past its own length: an abandoned clone may
//! have pushed entries that no published snapshot ever saw. Only one clone
//! is appended to at a time (the datastore writer lock guarantees this).

use crate::iterator::{EntryDescriptor, ReadAt, iterate};
use parking_lot::RwLock;
use std::sync::Arc;
use zinc_common::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct TimestampIndex {
    entries: Arc<RwLock<Vec<(i64, u64)>>>,
    len: usize,
    total_size: u64,
}

impl TimestampIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// End offset of the last indexed entry
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of distinct commit times indexed
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Latest indexed commit time, or -1 when empty
    #[must_use]
    pub fn latest_timestamp(&self) -> i64 {
        if self.len == 0 {
            return -1;
        }
        self.entries.read()[self.len - 1].0
    }

    /// Offset of the first entry committed strictly after `t`
    #[must_use]
    pub fn find_offset_of_first_entry_updated_after(&self, t: i64) -> Option<u64> {
        let entries = self.entries.read();
        let visible = &entries[..self.len];
        let pos = visible.partition_point(|&(commit_time, _)| commit_time <= t);
        visible.get(pos).map(|&(_, offset)| offset)
    }

    /// Index the entries in `[start, end)` of `source`.
    ///
    /// `start` must equal the current `total_size`. Every descriptor is passed
    /// through `validate` before it is indexed; the first error stops the scan
    /// and is returned, leaving the entries indexed so far in place.
    pub fn append_from_entry_stream<S, F>(
        &mut self,
        source: &S,
        start: u64,
        end: u64,
        mut validate: F,
    ) -> Result<()>
    where
        S: ReadAt + ?Sized,
        F: FnMut(&EntryDescriptor<'_, S>) -> Result<()>,
    {
        if start != self.total_size {
            return Err(Error::internal(format!(
                "index append at {start} does not continue from {}",
                self.total_size
            )));
        }

        let mut entries = self.entries.write();
        entries.truncate(self.len);
        let mut latest = entries.last().map_or(-1, |&(t, _)| t);

        let mut result = Ok(());
        for descriptor in iterate(source, start, end, false) {
            let descriptor = match descriptor {
                Ok(d) => d,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };
            if let Err(e) = validate(&descriptor) {
                result = Err(e);
                break;
            }

            let commit_time = descriptor.primary_header.commit_time;
            if commit_time > latest {
                entries.push((commit_time, self.total_size));
                latest = commit_time;
            }
            self.total_size += descriptor.size;
        }

        self.len = entries.len();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flags;
    use crate::entry::{Entry, serialize_entry_with_checksums};

    fn committed(key: &str, commit_time: i64) -> Vec<u8> {
        let mut entry = Entry::json(format!("\"{key}\""), "1").with_flags(flags::TRANSACTION_END);
        entry.primary_header.commit_time = commit_time;
        serialize_entry_with_checksums(&entry)
    }

    fn stream(commit_times: &[i64]) -> Vec<u8> {
        commit_times
            .iter()
            .enumerate()
            .flat_map(|(i, &t)| committed(&format!("k{i}"), t))
            .collect()
    }

    #[test]
    fn test_first_occurrence_of_each_commit_time() {
        let bytes = stream(&[10, 20, 20, 30]);
        let entry_len = committed("k0", 10).len() as u64;

        let mut index = TimestampIndex::new();
        index
            .append_from_entry_stream(&bytes, 0, bytes.len() as u64, |_| Ok(()))
            .unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.total_size(), bytes.len() as u64);
        assert_eq!(index.latest_timestamp(), 30);

        assert_eq!(index.find_offset_of_first_entry_updated_after(0), Some(0));
        assert_eq!(
            index.find_offset_of_first_entry_updated_after(10),
            Some(entry_len)
        );
        assert_eq!(
            index.find_offset_of_first_entry_updated_after(25),
            Some(3 * entry_len)
        );
        assert_eq!(index.find_offset_of_first_entry_updated_after(30), None);
    }

    #[test]
    fn test_empty_index() {
        let index = TimestampIndex::new();
        assert_eq!(index.latest_timestamp(), -1);
        assert_eq!(index.find_offset_of_first_entry_updated_after(-5), None);
    }

    #[test]
    fn test_start_must_continue_total_size() {
        let bytes = stream(&[10]);
        let mut index = TimestampIndex::new();
        assert!(index
            .append_from_entry_stream(&bytes, 5, bytes.len() as u64, |_| Ok(()))
            .is_err());
    }

    #[test]
    fn test_validator_stops_scan() {
        let bytes = stream(&[10, 20, 30]);
        let mut index = TimestampIndex::new();
        let err = index
            .append_from_entry_stream(&bytes, 0, bytes.len() as u64, |d| {
                if d.primary_header.commit_time == 30 {
                    Err(Error::CorruptedEntry { offset: d.offset })
                } else {
                    Ok(())
                }
            })
            .unwrap_err();

        assert!(matches!(err, Error::CorruptedEntry { .. }));
        assert_eq!(index.latest_timestamp(), 20);
    }

    #[test]
    fn test_clone_is_isolated_from_abandoned_appends() {
        let first = stream(&[10, 20]);
        let mut published = TimestampIndex::new();
        published
            .append_from_entry_stream(&first, 0, first.len() as u64, |_| Ok(()))
            .unwrap();

        let mut bytes = first.clone();
        bytes.extend(committed("late", 40));

        // A clone extended and then abandoned
        let mut abandoned = published.clone();
        abandoned
            .append_from_entry_stream(&bytes, first.len() as u64, bytes.len() as u64, |_| Ok(()))
            .unwrap();
        assert_eq!(abandoned.latest_timestamp(), 40);
        assert_eq!(published.latest_timestamp(), 20);
        assert_eq!(published.find_offset_of_first_entry_updated_after(20), None);

        // A second clone of the published snapshot does not see the abandoned entry
        let mut next = published.clone();
        let mut other = first;
        other.extend(committed("other", 35));
        next.append_from_entry_stream(&other, next.total_size(), other.len() as u64, |_| Ok(()))
            .unwrap();
        assert_eq!(next.latest_timestamp(), 35);
        assert_eq!(next.len(), 3);
    }
}
