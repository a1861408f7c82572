//! Head entry
//!
//! Every datastore file starts with a fixed 512-byte head entry. Its key is
//! empty and its value carries the datastore format version and the
//! compaction bookkeeping. The head entry's commit time is the datastore
//! creation time and survives compactions.
//!
//! Value layout (little-endian, zero padded to 472 bytes):
//! ```text
//! +---------+--------------------+-------------------------+-------------------------+-------------------------------+
//! | Version | LastCompactionTime | LastCompactionCheckTime | LastCompactionCheckSize | LastCompactionCheckUnusedSize |
//! | 8B      | 8B                 | 8B                      | 8B                      | 8B                            |
//! +---------+--------------------+-------------------------+-------------------------+-------------------------------+
//! ```

use crate::codec::{DataFormat, PRIMARY_HEADER_SIZE, PrimaryHeader, flags};
use crate::entry::{Entry, serialize_entry_with_checksums};
use crate::iterator::{EntryDescriptor, ReadAt, iterate};
use crate::safe_io::FileGuard;
use zinc_common::{Error, Result};

/// Size of the head entry on disk
pub const HEAD_ENTRY_SIZE: u64 = 512;

/// Size of the head entry's value payload
pub const HEAD_ENTRY_VALUE_SIZE: usize = HEAD_ENTRY_SIZE as usize - PRIMARY_HEADER_SIZE;

/// Current datastore format version
pub const HEAD_ENTRY_VERSION: u64 = 1;

/// Decoded head entry value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadEntryValue {
    pub version: u64,
    pub last_compaction_time: i64,
    pub last_compaction_check_time: i64,
    pub last_compaction_check_size: i64,
    pub last_compaction_check_unused_size: i64,
}

impl Default for HeadEntryValue {
    fn default() -> Self {
        Self {
            version: HEAD_ENTRY_VERSION,
            last_compaction_time: 0,
            last_compaction_check_time: 0,
            last_compaction_check_size: 0,
            last_compaction_check_unused_size: 0,
        }
    }
}

impl HeadEntryValue {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEAD_ENTRY_VALUE_SIZE];
        buf[0..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..16].copy_from_slice(&self.last_compaction_time.to_le_bytes());
        buf[16..24].copy_from_slice(&self.last_compaction_check_time.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_compaction_check_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.last_compaction_check_unused_size.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HEAD_ENTRY_VALUE_SIZE {
            return Err(Error::InvalidHeadEntry);
        }
        let field = |i: usize| -> [u8; 8] { data[i * 8..i * 8 + 8].try_into().expect("8 bytes") };

        let value = Self {
            version: u64::from_le_bytes(field(0)),
            last_compaction_time: i64::from_le_bytes(field(1)),
            last_compaction_check_time: i64::from_le_bytes(field(2)),
            last_compaction_check_size: i64::from_le_bytes(field(3)),
            last_compaction_check_unused_size: i64::from_le_bytes(field(4)),
        };
        if value.version == 0 {
            return Err(Error::InvalidHeadEntry);
        }
        Ok(value)
    }
}

/// Whether a primary header has the shape of a head entry
#[must_use]
pub const fn is_head_entry_header(header: &PrimaryHeader) -> bool {
    header.total_size == HEAD_ENTRY_SIZE
        && header.key_size == 0
        && header.secondary_header_size == 0
}

/// Serialize a head entry committed at `creation_time`, checksums included
#[must_use]
pub fn create_serialized_head_entry(value: &HeadEntryValue, creation_time: i64) -> Vec<u8> {
    let mut entry = Entry::new(
        Vec::new(),
        DataFormat::Binary,
        value.to_bytes(),
        DataFormat::Binary,
    )
    .with_update_time(creation_time)
    .with_flags(flags::TRANSACTION_END | flags::CREATION_EVENT);
    entry.primary_header.commit_time = creation_time;
    serialize_entry_with_checksums(&entry)
}

/// Validate a descriptor as a head entry and decode its value
pub fn decode_head_entry<S: ReadAt + ?Sized>(
    descriptor: &EntryDescriptor<'_, S>,
) -> Result<HeadEntryValue> {
    if descriptor.offset != 0 || !is_head_entry_header(&descriptor.primary_header) {
        return Err(Error::InvalidHeadEntry);
    }
    descriptor
        .verify_checksums()
        .map_err(|_| Error::InvalidHeadEntry)?;
    HeadEntryValue::from_bytes(&descriptor.read_value()?)
}

/// Read and validate the head entry at the start of `source`.
///
/// Returns the head entry's primary header and decoded value.
pub fn read_head_entry<S: ReadAt + ?Sized>(
    source: &S,
    end: u64,
) -> Result<(PrimaryHeader, HeadEntryValue)> {
    if end < HEAD_ENTRY_SIZE {
        return Err(Error::InvalidHeadEntry);
    }
    let descriptor = iterate(source, 0, HEAD_ENTRY_SIZE, false)
        .next()
        .ok_or(Error::InvalidHeadEntry)?
        .map_err(|_| Error::InvalidHeadEntry)?;
    let value = decode_head_entry(&descriptor)?;
    Ok((descriptor.primary_header, value))
}

/// Overwrite the head entry of an open datastore file in place
pub fn rewrite_head_entry(
    file: &FileGuard,
    value: &HeadEntryValue,
    creation_time: i64,
) -> Result<()> {
    file.write_all_at(&create_serialized_head_entry(value, creation_time), 0)
}
