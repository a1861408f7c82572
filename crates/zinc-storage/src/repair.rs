//! Safe truncation scan
//!
//! Finds the longest prefix of a datastore file that is made of a valid head
//! entry followed by complete transactions. Entries committed at or before
//! the head's `LastCompactionTime` count as durable even without a
//! transaction terminator, because compaction may drop the terminating entry
//! of a transaction while keeping earlier ones.

use crate::head::{HEAD_ENTRY_SIZE, decode_head_entry};
use crate::iterator::{ReadAt, iterate};
use tracing::debug;
use zinc_common::{Error, Result};

/// Length of the longest valid prefix of `[0, end)` of `source`.
///
/// Returns 0 when the head entry itself is missing or invalid. Only I/O
/// errors other than short reads are returned as errors.
pub fn find_safe_truncation_size<S: ReadAt + ?Sized>(source: &S, end: u64) -> Result<u64> {
    let mut entries = iterate(source, 0, end, false);

    let head = match entries.next() {
        Some(Ok(descriptor)) => match decode_head_entry(&descriptor) {
            Ok(value) => value,
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(_) => return Ok(0),
        },
        Some(Err(Error::Io(e))) => return Err(Error::Io(e)),
        Some(Err(_)) | None => return Ok(0),
    };

    let mut truncation = HEAD_ENTRY_SIZE;
    for descriptor in entries {
        let descriptor = match descriptor {
            Ok(d) => d,
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(e) => {
                debug!("Scan stopped at {}: {}", truncation, e);
                break;
            }
        };

        match descriptor.verify_checksums() {
            Ok(()) => {}
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(e) => {
                debug!("Scan stopped at {}: {}", descriptor.offset, e);
                break;
            }
        }

        if descriptor.primary_header.is_transaction_end()
            || descriptor.primary_header.commit_time <= head.last_compaction_time
        {
            truncation = descriptor.end_offset();
        }
    }

    Ok(truncation)
}
