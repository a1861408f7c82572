//! Entry serialization
//!
//! An entry is a primary header, an optional secondary header (currently
//! always empty), a key and a value, laid out contiguously. Checksums are
//! applied to an already serialized entry by
//! [`add_checksums_to_serialized_entry`], so the validator can re-stamp a
//! header in place and recompute them.

use crate::codec::{
    DataFormat, HEADER_CHECKSUM_OFFSET, PAYLOAD_CHECKSUM_OFFSET, PRIMARY_HEADER_SIZE,
    PrimaryHeader, compute_header_checksum, deserialize_primary_header, flags,
    serialize_primary_header,
};
use zinc_common::checksum::{compute_crc32c, verify_crc32c};
use zinc_common::time::now_us;
use zinc_common::{Error, JsonEntrySource, Result};

/// A fully materialized entry
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub primary_header: PrimaryHeader,
    pub secondary_header: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Entry {
    /// Create an entry with the given formats; sizes are filled on serialization
    pub fn new(
        key: impl Into<Vec<u8>>,
        key_format: DataFormat,
        value: impl Into<Vec<u8>>,
        value_format: DataFormat,
    ) -> Self {
        Self {
            primary_header: PrimaryHeader {
                key_format: key_format as u8,
                value_format: value_format as u8,
                ..PrimaryHeader::default()
            },
            secondary_header: Vec::new(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Entry with a JSON key and a JSON value
    pub fn json(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, DataFormat::Json, value, DataFormat::Json)
    }

    #[must_use]
    pub const fn with_update_time(mut self, update_time: i64) -> Self {
        self.primary_header.update_time = update_time;
        self
    }

    #[must_use]
    pub const fn with_flags(mut self, flags: u8) -> Self {
        self.primary_header.flags = flags;
        self
    }

    /// Serialized size of this entry
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        PRIMARY_HEADER_SIZE + self.secondary_header.len() + self.key.len() + self.value.len()
    }

    #[must_use]
    pub const fn is_transaction_end(&self) -> bool {
        self.primary_header.is_transaction_end()
    }
}

impl JsonEntrySource for Entry {
    fn json_key(&self) -> Option<&[u8]> {
        (self.primary_header.key_format == DataFormat::Json as u8).then_some(self.key.as_slice())
    }

    fn json_value(&self) -> Option<&[u8]> {
        (self.primary_header.value_format == DataFormat::Json as u8)
            .then_some(self.value.as_slice())
    }
}

/// Serialize an entry into a contiguous buffer.
///
/// Fills `total_size`, `key_size` and `secondary_header_size`, and defaults
/// `update_time` to now when it is zero. Checksum fields are written as
/// found in the header; use [`add_checksums_to_serialized_entry`] to stamp
/// them.
///
/// # Panics
/// If the key is longer than `u16::MAX` bytes or the secondary header is
/// longer than `u16::MAX` bytes.
#[must_use]
pub fn serialize_entry(entry: &Entry) -> Vec<u8> {
    let mut header = entry.primary_header;
    header.total_size = entry.serialized_size() as u64;
    header.key_size = u16::try_from(entry.key.len()).expect("key longer than 65535 bytes");
    header.secondary_header_size = u16::try_from(entry.secondary_header.len())
        .expect("secondary header longer than 65535 bytes");
    if header.update_time == 0 {
        header.update_time = now_us();
    }

    let mut buf = vec![0u8; entry.serialized_size()];
    serialize_primary_header(&mut buf, &header);
    let mut pos = PRIMARY_HEADER_SIZE;
    for part in [&entry.secondary_header, &entry.key, &entry.value] {
        buf[pos..pos + part.len()].copy_from_slice(part);
        pos += part.len();
    }
    buf
}

/// Serialize an entry and stamp its checksums
#[must_use]
pub fn serialize_entry_with_checksums(entry: &Entry) -> Vec<u8> {
    let mut buf = serialize_entry(entry);
    add_checksums_to_serialized_entry(&mut buf);
    buf
}

/// Serialize several entries back to back, each with checksums
#[must_use]
pub fn serialize_entries(entries: &[Entry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.iter().map(Entry::serialized_size).sum());
    for entry in entries {
        buf.extend_from_slice(&serialize_entry_with_checksums(entry));
    }
    buf
}

/// Compute and store both checksums of a single serialized entry.
///
/// # Panics
/// If `entry` is shorter than a primary header.
pub fn add_checksums_to_serialized_entry(entry: &mut [u8]) {
    let payload_checksum = compute_crc32c(&entry[PRIMARY_HEADER_SIZE..]);
    entry[PAYLOAD_CHECKSUM_OFFSET..PAYLOAD_CHECKSUM_OFFSET + 4]
        .copy_from_slice(&payload_checksum.to_le_bytes());

    let header_checksum = compute_header_checksum(entry);
    entry[HEADER_CHECKSUM_OFFSET..HEADER_CHECKSUM_OFFSET + 4]
        .copy_from_slice(&header_checksum.to_le_bytes());
}

/// Whether the header checksum of a serialized header matches
#[must_use]
pub fn verify_header_checksum(serialized_header: &[u8], header: &PrimaryHeader) -> bool {
    serialized_header.len() >= PRIMARY_HEADER_SIZE
        && compute_header_checksum(serialized_header) == header.header_checksum
}

/// Whether the payload checksum recorded in `header` matches `payload`
#[must_use]
pub fn verify_payload_checksum(payload: &[u8], header: &PrimaryHeader) -> bool {
    verify_crc32c(payload, header.payload_checksum)
}

/// Verify both checksums of a single serialized entry located at `offset`
/// (the offset is only used for error reporting).
pub fn verify_serialized_entry_checksums(entry: &[u8], offset: u64) -> Result<()> {
    let header = deserialize_primary_header(entry)?;
    if !verify_header_checksum(entry, &header)
        || !verify_payload_checksum(&entry[PRIMARY_HEADER_SIZE..], &header)
    {
        return Err(Error::CorruptedEntry { offset });
    }
    Ok(())
}

/// Decode a single serialized entry (checksums are not verified)
pub fn deserialize_entry(buf: &[u8]) -> Result<Entry> {
    let header = deserialize_primary_header(buf)?;
    if !header.sizes_are_consistent() {
        return Err(Error::CorruptedEntry { offset: 0 });
    }
    let total = usize::try_from(header.total_size).map_err(|_| Error::UnexpectedEof)?;
    if buf.len() < total {
        return Err(Error::UnexpectedEof);
    }

    let key_start = PRIMARY_HEADER_SIZE + header.secondary_header_size as usize;
    let value_start = key_start + header.key_size as usize;
    Ok(Entry {
        primary_header: header,
        secondary_header: buf[PRIMARY_HEADER_SIZE..key_start].to_vec(),
        key: buf[key_start..value_start].to_vec(),
        value: buf[value_start..total].to_vec(),
    })
}

/// Decode a buffer holding zero or more consecutive entries
pub fn deserialize_entries(buf: &[u8]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        let entry = deserialize_entry(&buf[pos..]).map_err(|e| match e {
            Error::CorruptedEntry { .. } => Error::CorruptedEntry { offset: pos as u64 },
            other => other,
        })?;
        pos += entry.primary_header.total_size as usize;
        entries.push(entry);
    }
    Ok(entries)
}

/// Mark the last entry of `entries` as ending the transaction and clear the
/// flag on every other entry
pub fn mark_transaction_end(entries: &mut [Entry]) {
    let count = entries.len();
    for (i, entry) in entries.iter_mut().enumerate() {
        if i + 1 == count {
            entry.primary_header.flags |= flags::TRANSACTION_END;
        } else {
            entry.primary_header.flags &= !flags::TRANSACTION_END;
        }
    }
}
