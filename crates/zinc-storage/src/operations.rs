//! Datastore operations
//!
//! [`DatastoreOperations`] owns one datastore file and publishes an immutable
//! [`DatastoreState`] for it. Readers grab the current state and read
//! without locking. Every change (append, rewrite, compaction, destroy)
//! runs under the per-datastore writer lock, builds a new state and swaps it
//! in as a whole.
//!
//! Loading scans the whole file. If the scan hits a truncated or corrupted
//! entry or an invalid head entry, the file is backed up to
//! `<path>.corrupted-<us>`, truncated to its longest valid prefix and loaded
//! again.

use crate::codec::flags;
use crate::entry::deserialize_entries;
use crate::flush::FlushScheduler;
use crate::head::{
    HEAD_ENTRY_SIZE, HeadEntryValue, create_serialized_head_entry, read_head_entry,
    rewrite_head_entry,
};
use crate::key_index::KeyHashIndex;
use crate::notifier::UpdateNotifier;
use crate::repair::find_safe_truncation_size;
use crate::safe_io::{
    FileGuard, RangeReader, create_or_rewrite_file_safe, sibling_path, unlink_file_safe,
};
use crate::state::DatastoreState;
use crate::timestamp_index::TimestampIndex;
use crate::validator::{ValidationOptions, validate_and_prepare};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use zinc_common::config::keys;
use zinc_common::time::now_us;
use zinc_common::{DatastoreConfigSnapshot, Error, Result, VarMap};

/// Limits and durability settings for a write
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Schedule a flush after the write
    pub flush: bool,
    /// Delay before the scheduled flush; zero syncs inline
    pub max_flush_delay: Duration,
    /// Maximum size of the datastore file
    pub max_size: Option<u64>,
    /// Maximum size of a single entry
    pub max_entry_size: Option<u64>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            flush: true,
            max_flush_delay: Duration::from_millis(1000),
            max_size: None,
            max_entry_size: None,
        }
    }
}

impl WriteOptions {
    #[must_use]
    pub fn from_config(config: &DatastoreConfigSnapshot) -> Self {
        let defaults = Self::default();
        let max_delay_ms = config.int64_or(keys::FLUSH_MAX_DELAY, 1000).max(0);
        let limit = |key| u64::try_from(config.int64_or(key, 0)).ok().filter(|&v| v > 0);
        Self {
            flush: config.bool_or(keys::FLUSH_ENABLED, defaults.flush),
            max_flush_delay: Duration::from_millis(max_delay_ms.unsigned_abs()),
            max_size: limit(keys::LIMIT_MAX_SIZE),
            max_entry_size: limit(keys::LIMIT_MAX_ENTRY_SIZE),
        }
    }
}

/// Thresholds deciding when a datastore is compacted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPolicy {
    /// Files smaller than this are never checked
    pub min_size: u64,
    /// The file must grow by this factor since the last check
    pub min_growth_ratio: f64,
    /// Fraction of the file that must be reclaimable
    pub min_unused_size_ratio: f64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            min_size: 512 * 1024,
            min_growth_ratio: 2.0,
            min_unused_size_ratio: 0.5,
        }
    }
}

impl CompactionPolicy {
    /// Policy from configuration, `None` when compaction is disabled
    #[must_use]
    pub fn from_config(config: &DatastoreConfigSnapshot) -> Option<Self> {
        if !config.bool_or(keys::COMPACTION_ENABLED, true) {
            return None;
        }
        let defaults = Self::default();
        let min_size = config.int64_or(keys::COMPACTION_MIN_SIZE, 512 * 1024).max(0);
        Some(Self {
            min_size: min_size.unsigned_abs(),
            min_growth_ratio: config
                .float64_or(keys::COMPACTION_MIN_GROWTH_RATIO, defaults.min_growth_ratio),
            min_unused_size_ratio: config.float64_or(
                keys::COMPACTION_MIN_UNUSED_SIZE_RATIO,
                defaults.min_unused_size_ratio,
            ),
        })
    }
}

/// What a compaction check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// Thresholds not reached, nothing scanned
    Skipped,
    /// Scanned, not worth rewriting; the head entry records the check
    Checked { size: u64, unused_size: u64 },
    /// Rewritten without superseded entries
    Compacted { old_size: u64, new_size: u64 },
}

/// Entries committed after a given time, and the state they were read from
#[derive(Debug)]
pub struct Updates {
    pub data: Vec<u8>,
    pub last_modified: i64,
}

pub struct DatastoreOperations {
    name: String,
    path: PathBuf,
    is_cached: bool,
    state: RwLock<Option<Arc<DatastoreState>>>,
    load_lock: Mutex<()>,
    writer: Mutex<()>,
    notifier: UpdateNotifier,
}

impl DatastoreOperations {
    /// Operations for the datastore stored at `path`. With `is_cached`, the
    /// file's JSON entries are also kept parsed as a [`VarMap`].
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, is_cached: bool) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_cached,
            state: RwLock::new(None),
            load_lock: Mutex::new(()),
            writer: Mutex::new(()),
            notifier: UpdateNotifier::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_cached(&self) -> bool {
        self.is_cached
    }

    /// Whether the datastore file exists on disk
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Currently published state, if loaded
    #[must_use]
    pub fn current_state(&self) -> Option<Arc<DatastoreState>> {
        self.state.read().clone()
    }

    fn publish(&self, state: DatastoreState) -> Arc<DatastoreState> {
        let state = Arc::new(state);
        *self.state.write() = Some(Arc::clone(&state));
        state
    }

    fn unpublish(&self) {
        self.state.write().take();
    }

    fn not_found(&self, error: Error) -> Error {
        if error.is_not_found() {
            Error::DatastoreNotFound(self.name.clone())
        } else {
            error
        }
    }

    /// Create the datastore file with a fresh head entry. Returns `false` if
    /// it already exists.
    pub fn create_if_missing(&self) -> Result<bool> {
        let _writer = self.writer.lock();
        if self.exists() {
            return Ok(false);
        }
        let head = create_serialized_head_entry(&HeadEntryValue::default(), now_us());
        create_or_rewrite_file_safe(&self.path, &mut head.as_slice())?;
        info!("Created datastore {}", self.name);
        Ok(true)
    }

    /// Return the published state, loading the datastore if needed
    pub fn load_if_needed(&self) -> Result<Arc<DatastoreState>> {
        if let Some(state) = self.current_state() {
            return Ok(state);
        }

        let _load = self.load_lock.lock();
        if let Some(state) = self.current_state() {
            return Ok(state);
        }
        self.load()
    }

    /// Load the datastore from disk, repairing it if needed, and publish it
    pub fn load(&self) -> Result<Arc<DatastoreState>> {
        let state = match self.open_and_index() {
            Err(e) if e.is_repairable() => {
                self.repair(&e)?;
                self.open_and_index()?
            }
            other => other?,
        };
        debug!(
            "Loaded datastore {} ({} bytes)",
            self.name,
            state.total_size()
        );
        Ok(self.publish(state))
    }

    fn open_and_index(&self) -> Result<DatastoreState> {
        let file = FileGuard::open_and_increment(&self.path).map_err(|e| self.not_found(e))?;
        let size = file.size()?;
        let (head_header, head_entry) = read_head_entry(&file, size)?;

        let mut index = TimestampIndex::new();
        let mut last = head_header;
        index.append_from_entry_stream(&file, 0, size, |descriptor| {
            if descriptor.offset == 0 {
                return Ok(());
            }
            if descriptor.primary_header.has_flag(flags::CREATION_EVENT) {
                return Err(Error::CorruptedEntry {
                    offset: descriptor.offset,
                });
            }
            descriptor.verify_checksums()?;
            last = descriptor.primary_header;
            Ok(())
        })?;

        // A compacted tail may lack its terminator; anything newer must have one
        if !last.is_transaction_end() && last.commit_time > head_entry.last_compaction_time {
            return Err(Error::UnexpectedEof);
        }

        let config_cache = if self.is_cached {
            let bytes = RangeReader::new(&file, HEAD_ENTRY_SIZE, size).read_to_vec()?;
            let mut map = VarMap::new();
            map.append_json_entries(&deserialize_entries(&bytes)?);
            Some(Arc::new(map))
        } else {
            None
        };

        Ok(DatastoreState {
            file,
            // Pending flushes belong to the descriptor they were scheduled on
            flush_scheduler: Arc::new(FlushScheduler::new()),
            index,
            head_entry,
            config_cache,
            creation_time: head_header.commit_time,
        })
    }

    /// Index the file just written over the datastore path. The published
    /// state no longer matches the file, so it is dropped if indexing fails.
    fn reload_replaced(&self) -> Result<DatastoreState> {
        self.open_and_index().inspect_err(|e| {
            warn!("Failed to reload {} after replacing it: {}", self.name, e);
            self.unpublish();
        })
    }

    fn repair(&self, cause: &Error) -> Result<()> {
        let file = FileGuard::open_and_increment(&self.path).map_err(|e| self.not_found(e))?;
        let size = file.size()?;
        let repaired_size = find_safe_truncation_size(&file, size)?;

        let backup = sibling_path(&self.path, "corrupted");
        fs::rename(&self.path, &backup)?;
        warn!(
            "Datastore {} failed to load ({}); backed up to {:?}, truncating {} -> {} bytes",
            self.name, cause, backup, size, repaired_size
        );

        if repaired_size == 0 {
            let head = create_serialized_head_entry(&HeadEntryValue::default(), now_us());
            create_or_rewrite_file_safe(&self.path, &mut head.as_slice())
        } else {
            create_or_rewrite_file_safe(&self.path, &mut RangeReader::new(&file, 0, repaired_size))
        }
    }

    /// Read every entry committed strictly after `updated_after`
    pub fn read_updates(&self, updated_after: i64) -> Result<Updates> {
        let state = self.load_if_needed()?;
        let data = state.create_reader(updated_after).read_to_vec()?;
        Ok(Updates {
            data,
            last_modified: state.last_modified_time(),
        })
    }

    /// Configuration parsed from this datastore; empty unless `is_cached`
    pub fn config(&self) -> Result<Arc<VarMap>> {
        let state = self.load_if_needed()?;
        Ok(state.config_cache.clone().unwrap_or_default())
    }

    /// A commit time strictly greater than the state's last modification
    #[must_use]
    pub fn get_collision_free_timestamp(state: &DatastoreState) -> i64 {
        let last = state.last_modified_time();
        loop {
            let now = now_us();
            if now > last {
                return now;
            }
            if now < last {
                std::thread::sleep(Duration::from_micros((last - now).unsigned_abs()));
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Validate a client transaction, stamp it and append it.
    /// Returns the commit time.
    pub fn append_transaction(&self, mut bytes: Vec<u8>, options: &WriteOptions) -> Result<i64> {
        let _writer = self.writer.lock();
        let state = self.load_if_needed()?;
        let commit_time = Self::get_collision_free_timestamp(&state);
        let count = validate_and_prepare(
            &mut bytes,
            commit_time,
            ValidationOptions {
                max_entry_size: options.max_entry_size,
            },
        )?;
        if count == 0 {
            return Err(Error::EmptyTransaction);
        }
        self.append_locked(&state, &bytes, commit_time, options)?;
        Ok(commit_time)
    }

    /// Append an already prepared transaction committed at `commit_time`
    pub fn append(&self, bytes: &[u8], commit_time: i64, options: &WriteOptions) -> Result<()> {
        let _writer = self.writer.lock();
        let state = self.load_if_needed()?;
        self.append_locked(&state, bytes, commit_time, options)
    }

    fn append_locked(
        &self,
        state: &DatastoreState,
        bytes: &[u8],
        commit_time: i64,
        options: &WriteOptions,
    ) -> Result<()> {
        let old_size = state.total_size();
        let new_size = old_size + bytes.len() as u64;
        if let Some(max_size) = options.max_size
            && new_size > max_size
        {
            return Err(Error::DatastoreTooLarge {
                size: new_size,
                max_size,
            });
        }

        let mut next = state.clone();
        let appended = next.file.write_all_at(bytes, old_size).and_then(|()| {
            next.index
                .append_from_entry_stream(&next.file, old_size, new_size, |_| Ok(()))
        });
        if let Err(e) = appended {
            if let Err(truncate) = next.file.set_len(old_size) {
                warn!("Failed to roll back {}: {}", self.name, truncate);
            }
            return Err(e);
        }

        if let Some(cache) = &state.config_cache {
            let mut map = VarMap::clone(cache);
            map.append_json_entries(&deserialize_entries(bytes)?);
            next.config_cache = Some(Arc::new(map));
        }

        if options.flush {
            next.flush_scheduler
                .ensure_flush_in_background(&next.file, options.max_flush_delay);
        }

        self.publish(next);
        self.notifier.announce(commit_time);
        debug!(
            "Appended {} bytes to {} at {}",
            bytes.len(),
            self.name,
            commit_time
        );
        Ok(())
    }

    /// Validate a client transaction and replace the whole datastore content
    /// with it. Returns the commit time.
    pub fn rewrite_transaction(&self, mut bytes: Vec<u8>, options: &WriteOptions) -> Result<i64> {
        let _writer = self.writer.lock();
        let state = self.load_if_needed()?;
        let commit_time = Self::get_collision_free_timestamp(&state);
        validate_and_prepare(
            &mut bytes,
            commit_time,
            ValidationOptions {
                max_entry_size: options.max_entry_size,
            },
        )?;
        self.rewrite_locked(&state, &bytes, commit_time, options)?;
        Ok(commit_time)
    }

    /// Replace the datastore content with an already prepared transaction
    pub fn rewrite(&self, bytes: &[u8], commit_time: i64, options: &WriteOptions) -> Result<()> {
        let _writer = self.writer.lock();
        let state = self.load_if_needed()?;
        self.rewrite_locked(&state, bytes, commit_time, options)
    }

    fn rewrite_locked(
        &self,
        state: &DatastoreState,
        bytes: &[u8],
        commit_time: i64,
        options: &WriteOptions,
    ) -> Result<()> {
        let new_size = HEAD_ENTRY_SIZE + bytes.len() as u64;
        if let Some(max_size) = options.max_size
            && new_size > max_size
        {
            return Err(Error::DatastoreTooLarge {
                size: new_size,
                max_size,
            });
        }

        let head = create_serialized_head_entry(&HeadEntryValue::default(), state.creation_time);
        create_or_rewrite_file_safe(&self.path, &mut head.as_slice().chain(bytes))?;

        let next = self.reload_replaced()?;
        if options.flush {
            next.flush_scheduler
                .ensure_flush_in_background(&next.file, options.max_flush_delay);
        }
        self.publish(next);
        self.notifier.announce(commit_time);
        info!("Rewrote {} ({} bytes)", self.name, new_size);
        Ok(())
    }

    /// Compact the datastore when `policy` says it is worth it
    pub fn compact_if_needed(&self, policy: &CompactionPolicy) -> Result<CompactionOutcome> {
        let _writer = self.writer.lock();
        let state = self.load_if_needed()?;

        let size = state.total_size();
        if size < policy.min_size {
            return Ok(CompactionOutcome::Skipped);
        }
        #[allow(clippy::cast_precision_loss)]
        let growth_threshold =
            state.head_entry.last_compaction_check_size as f64 * policy.min_growth_ratio;
        #[allow(clippy::cast_precision_loss)]
        let size_f = size as f64;
        if size_f < growth_threshold {
            return Ok(CompactionOutcome::Skipped);
        }

        let mut key_index = KeyHashIndex::new();
        key_index.add_from_entry_stream(&state.file, 0, size)?;
        let compacted_size = key_index.compacted_size();
        let unused_size = size - compacted_size.min(size);

        #[allow(clippy::cast_precision_loss)]
        let unused_ratio = if size == 0 { 0.0 } else { unused_size as f64 / size_f };
        let now = now_us();
        let size_i64 = i64::try_from(size).unwrap_or(i64::MAX);

        if unused_ratio < policy.min_unused_size_ratio {
            let head_entry = HeadEntryValue {
                last_compaction_check_time: now,
                last_compaction_check_size: size_i64,
                last_compaction_check_unused_size: i64::try_from(unused_size).unwrap_or(i64::MAX),
                ..state.head_entry
            };
            rewrite_head_entry(&state.file, &head_entry, state.creation_time)?;

            let mut next = DatastoreState::clone(&state);
            next.head_entry = head_entry;
            self.publish(next);
            debug!(
                "Compaction check on {}: {} of {} bytes unused",
                self.name, unused_size, size
            );
            return Ok(CompactionOutcome::Checked { size, unused_size });
        }

        let head_entry = HeadEntryValue {
            last_compaction_time: now,
            last_compaction_check_time: now,
            last_compaction_check_size: i64::try_from(compacted_size).unwrap_or(i64::MAX),
            last_compaction_check_unused_size: 0,
            ..state.head_entry
        };
        let head = create_serialized_head_entry(&head_entry, state.creation_time);
        let mut reader = head
            .as_slice()
            .chain(key_index.create_reader_for_compacted_ranges(&state.file, HEAD_ENTRY_SIZE));
        create_or_rewrite_file_safe(&self.path, &mut reader)?;

        let next = self.reload_replaced()?;
        let new_size = next.total_size();
        self.publish(next);
        info!("Compacted {}: {} -> {} bytes", self.name, size, new_size);
        Ok(CompactionOutcome::Compacted {
            old_size: size,
            new_size,
        })
    }

    /// Delete the datastore file and wake every subscriber
    pub fn destroy(&self) -> Result<()> {
        let _writer = self.writer.lock();
        // Held so no load can publish the unlinked file
        let _load = self.load_lock.lock();
        unlink_file_safe(&self.path).map_err(|e| self.not_found(e))?;
        self.unpublish();
        self.notifier.announce(i64::MAX);
        info!("Destroyed datastore {}", self.name);
        Ok(())
    }

    /// Unpublish the current state; it is dropped once its readers finish
    pub fn close(&self) {
        self.unpublish();
    }

    /// Wait for a commit newer than `min_timestamp`
    pub fn subscribe(&self, min_timestamp: i64) -> oneshot::Receiver<i64> {
        self.notifier.subscribe(min_timestamp)
    }
}

impl std::fmt::Debug for DatastoreOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreOperations")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("is_cached", &self.is_cached)
            .finish_non_exhaustive()
    }
}
