//! ZincServer Storage Engine - Append-only datastore files
//!
//! This crate implements the storage core of ZincServer including:
//! - Entry framing and checksums
//! - Forward iteration over entry streams
//! - Safe file replacement and reference-counted descriptors
//! - Commit-time and key-hash indices
//! - Repair of truncated or corrupted files
//! - Deferred flushing, update notification and transaction validation
//! - Datastore load/append/rewrite/compaction orchestration

pub mod codec;
pub mod entry;
pub mod flush;
pub mod head;
pub mod iterator;
pub mod key_index;
pub mod notifier;
pub mod operations;
pub mod repair;
pub mod safe_io;
pub mod state;
pub mod timestamp_index;
pub mod validator;

// Re-exports
pub use codec::{DataFormat, PRIMARY_HEADER_SIZE, PrimaryHeader, flags};
pub use entry::{
    Entry, add_checksums_to_serialized_entry, deserialize_entries, deserialize_entry,
    serialize_entries, serialize_entry, serialize_entry_with_checksums,
};
pub use flush::FlushScheduler;
pub use head::{HEAD_ENTRY_SIZE, HeadEntryValue};
pub use iterator::{EntryDescriptor, EntryStreamIterator, RangeListIterator, ReadAt, iterate};
pub use key_index::KeyHashIndex;
pub use notifier::UpdateNotifier;
pub use operations::{
    CompactionOutcome, CompactionPolicy, DatastoreOperations, Updates, WriteOptions,
};
pub use repair::find_safe_truncation_size;
pub use safe_io::{FileGuard, RangeListReader, RangeReader};
pub use state::DatastoreState;
pub use timestamp_index::TimestampIndex;
pub use validator::{ValidationOptions, validate_and_prepare};
