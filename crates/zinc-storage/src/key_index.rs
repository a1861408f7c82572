//! Key-hash index used by compaction
//!
//! Maps SHA-1 of each key to the byte range of the latest entry carrying
//! that key. The index is not persisted; it is built on demand over the
//! whole file when a compaction check runs. Sorting the surviving ranges by
//! start offset keeps the commit-time order of the original file.

use crate::iterator::{ReadAt, iterate};
use crate::safe_io::RangeListReader;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use zinc_common::Result;

pub type KeyHash = [u8; 20];

/// SHA-1 of a key
#[must_use]
pub fn hash_key(key: &[u8]) -> KeyHash {
    Sha1::digest(key).into()
}

#[derive(Debug, Clone, Default)]
pub struct KeyHashIndex {
    ranges: HashMap<KeyHash, (u64, u64)>,
}

impl KeyHashIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record the entries of `[start, end)`; later entries replace earlier
    /// ones with the same key
    pub fn add_from_entry_stream<S: ReadAt + ?Sized>(
        &mut self,
        source: &S,
        start: u64,
        end: u64,
    ) -> Result<()> {
        for descriptor in iterate(source, start, end, false) {
            let descriptor = descriptor?;
            let key = descriptor.read_key()?;
            self.ranges
                .insert(hash_key(&key), (descriptor.offset, descriptor.end_offset()));
        }
        Ok(())
    }

    /// Surviving ranges starting at or after `read_offset`, in file order.
    /// With `consolidate`, touching ranges are merged.
    #[must_use]
    pub fn compacted_ranges(&self, read_offset: u64, consolidate: bool) -> Vec<(u64, u64)> {
        let mut ranges: Vec<(u64, u64)> = self
            .ranges
            .values()
            .copied()
            .filter(|&(start, _)| start >= read_offset)
            .collect();
        ranges.sort_unstable_by_key(|&(start, _)| start);

        if !consolidate {
            return ranges;
        }

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    /// Total size of all surviving entries
    #[must_use]
    pub fn compacted_size(&self) -> u64 {
        self.ranges.values().map(|(start, end)| end - start).sum()
    }

    /// Stream the surviving entries starting at or after `start`
    pub fn create_reader_for_compacted_ranges<S: ReadAt>(
        &self,
        source: S,
        start: u64,
    ) -> RangeListReader<S> {
        RangeListReader::new(source, self.compacted_ranges(start, true))
    }
}
