//! Incoming transaction validation
//!
//! Client-supplied entry buffers are checked entry by entry and then prepared
//! for appending in place: every entry is stamped with the server commit
//! time, the last entry is flagged as the end of the transaction, and the
//! checksums are recomputed over the updated headers.

use crate::codec::{
    DataFormat, PRIMARY_HEADER_SIZE, deserialize_primary_header, flags, serialize_primary_header,
};
use crate::entry::{add_checksums_to_serialized_entry, verify_serialized_entry_checksums};
use zinc_common::time::now_us;
use zinc_common::{Error, Result};

/// 2017-01-01T00:00:00Z in microseconds
pub const MIN_UPDATE_TIME: i64 = 1_483_228_800_000_000;

/// How far in the future an update time may lie
pub const MAX_UPDATE_TIME_SKEW_US: i64 = 30_000_000;

/// Validation limits
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    /// Reject any single entry larger than this
    pub max_entry_size: Option<u64>,
}

/// Validate a transaction buffer and prepare it for appending.
///
/// When `new_commit_ts > 0` every entry's commit time is overwritten with it.
/// Returns the number of entries; an empty buffer yields 0 and is left to the
/// caller to accept or reject.
pub fn validate_and_prepare(
    buf: &mut [u8],
    new_commit_ts: i64,
    options: ValidationOptions,
) -> Result<usize> {
    let now = now_us();
    let mut offset = 0usize;
    let mut count = 0usize;

    while offset < buf.len() {
        let mut header = deserialize_primary_header(&buf[offset..])?;
        if !header.sizes_are_consistent() {
            return Err(Error::CorruptedEntry {
                offset: offset as u64,
            });
        }
        let size = usize::try_from(header.total_size).map_err(|_| Error::UnexpectedEof)?;
        let end = offset.checked_add(size).ok_or(Error::UnexpectedEof)?;
        if end > buf.len() {
            return Err(Error::UnexpectedEof);
        }
        let is_last = end == buf.len();
        let entry = &mut buf[offset..end];
        verify_serialized_entry_checksums(entry, offset as u64)?;

        if header.key_size == 0 {
            return Err(Error::validation(format!("entry at {offset} has an empty key")));
        }
        if header.flags & !flags::TRANSACTION_END != 0 {
            return Err(Error::validation(format!(
                "entry at {offset} has reserved flags {:#04x}",
                header.flags
            )));
        }
        DataFormat::try_from(header.key_format)?;
        DataFormat::try_from(header.value_format)?;
        if header.update_time < MIN_UPDATE_TIME {
            return Err(Error::validation(format!(
                "entry at {offset} has update time {} before 2017",
                header.update_time
            )));
        }
        if header.update_time > now + MAX_UPDATE_TIME_SKEW_US {
            return Err(Error::validation(format!(
                "entry at {offset} has update time {} in the future",
                header.update_time
            )));
        }
        if let Some(max) = options.max_entry_size
            && header.total_size > max
        {
            return Err(Error::validation(format!(
                "entry at {offset} is {} bytes, limit is {max}",
                header.total_size
            )));
        }

        if new_commit_ts > 0 {
            header.commit_time = new_commit_ts;
        }
        if is_last {
            header.flags |= flags::TRANSACTION_END;
        } else {
            header.flags &= !flags::TRANSACTION_END;
        }
        serialize_primary_header(&mut entry[..PRIMARY_HEADER_SIZE], &header);
        add_checksums_to_serialized_entry(entry);

        offset = end;
        count += 1;
    }

    Ok(count)
}
