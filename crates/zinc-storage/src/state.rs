//! Published datastore snapshot

use crate::flush::FlushScheduler;
use crate::head::HeadEntryValue;
use crate::safe_io::{FileGuard, RangeReader};
use crate::timestamp_index::TimestampIndex;
use std::sync::Arc;
use zinc_common::VarMap;

/// Immutable view of a loaded datastore.
///
/// A new state is built for every change and swapped in as a whole; a
/// retired state drops its descriptor reference when the last reader
/// holding it finishes.
#[derive(Debug, Clone)]
pub struct DatastoreState {
    pub file: FileGuard,
    pub flush_scheduler: Arc<FlushScheduler>,
    pub index: TimestampIndex,
    pub head_entry: HeadEntryValue,
    /// Parsed configuration, only for configuration datastores
    pub config_cache: Option<Arc<VarMap>>,
    /// Commit time of the head entry
    pub creation_time: i64,
}

impl DatastoreState {
    /// Size of the datastore file covered by this state
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.index.total_size()
    }

    /// Latest time this datastore was modified. New commit times must be
    /// strictly greater.
    #[must_use]
    pub fn last_modified_time(&self) -> i64 {
        self.index
            .latest_timestamp()
            .max(self.head_entry.last_compaction_time)
            .max(self.creation_time)
    }

    /// Reader over every entry committed strictly after `updated_after`.
    /// The reader holds its own descriptor reference.
    #[must_use]
    pub fn create_reader(&self, updated_after: i64) -> RangeReader<FileGuard> {
        let end = self.total_size();
        let start = self
            .index
            .find_offset_of_first_entry_updated_after(updated_after)
            .unwrap_or(end);
        RangeReader::new(self.file.increment(), start, end)
    }
}
