//! Primary header codec
//!
//! Every entry starts with a fixed 40-byte little-endian primary header:
//! ```text
//! +-----------+------------+------------+---------+------+------+------+-------+------------+-----------+------------+
//! | TotalSize | UpdateTime | CommitTime | KeySize | KFmt | VFmt | Encr | Flags | SecHdrSize | HeaderCRC | PayloadCRC |
//! | 8B        | 8B         | 8B         | 2B      | 1B   | 1B   | 1B   | 1B    | 2B         | 4B        | 4B         |
//! +-----------+------------+------------+---------+------+------+------+-------+------------+-----------+------------+
//! ```
//! `HeaderCRC` is CRC32C over the first 32 bytes. `PayloadCRC` is CRC32C over
//! the secondary header, key and value that follow the primary header.
//!
//! Both checksums use the Castagnoli polynomial (CRC32C, `0x1EDC6F41`), not
//! the IEEE CRC32 used by zlib and Ethernet. Files checked with an IEEE
//! implementation fail validation.

use zinc_common::checksum::compute_crc32c;
use zinc_common::{Error, Result};

/// Size of the serialized primary header, checksums included
pub const PRIMARY_HEADER_SIZE: usize = 40;

/// Number of leading header bytes covered by the header checksum
pub const HEADER_CHECKSUM_COVERAGE: usize = 32;

/// Byte offset of the header checksum field
pub const HEADER_CHECKSUM_OFFSET: usize = 32;

/// Byte offset of the payload checksum field
pub const PAYLOAD_CHECKSUM_OFFSET: usize = 36;

/// Encoding of a key or value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataFormat {
    #[default]
    Binary = 0,
    Utf8 = 1,
    Json = 2,
}

impl TryFrom<u8> for DataFormat {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Binary),
            1 => Ok(Self::Utf8),
            2 => Ok(Self::Json),
            _ => Err(Error::validation(format!("unknown data format {value}"))),
        }
    }
}

/// Entry flag bits
pub mod flags {
    /// Last entry of a transaction
    pub const TRANSACTION_END: u8 = 0b01;
    /// Entry records the creation of the datastore (head entry only)
    pub const CREATION_EVENT: u8 = 0b10;
}

/// Decoded primary header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimaryHeader {
    /// Size of the whole entry: primary + secondary header + key + value
    pub total_size: u64,
    /// Client-assigned modification time, microseconds
    pub update_time: i64,
    /// Server-assigned commit time, microseconds
    pub commit_time: i64,
    pub key_size: u16,
    pub key_format: u8,
    pub value_format: u8,
    /// Reserved, always 0
    pub encryption_method: u8,
    pub flags: u8,
    pub secondary_header_size: u16,
    pub header_checksum: u32,
    pub payload_checksum: u32,
}

impl PrimaryHeader {
    #[must_use]
    pub const fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }

    #[must_use]
    pub const fn is_transaction_end(&self) -> bool {
        self.has_flag(flags::TRANSACTION_END)
    }

    /// Offset of the key relative to the start of the entry
    #[must_use]
    pub const fn key_offset(&self) -> u64 {
        PRIMARY_HEADER_SIZE as u64 + self.secondary_header_size as u64
    }

    /// Offset of the value relative to the start of the entry
    #[must_use]
    pub const fn value_offset(&self) -> u64 {
        self.key_offset() + self.key_size as u64
    }

    /// Value size implied by the declared field sizes. `None` when
    /// `total_size` is too small to hold the declared headers and key.
    #[must_use]
    pub const fn value_size(&self) -> Option<u64> {
        self.total_size.checked_sub(self.value_offset())
    }

    /// Whether the declared sizes describe a well-formed entry
    #[must_use]
    pub const fn sizes_are_consistent(&self) -> bool {
        self.total_size >= PRIMARY_HEADER_SIZE as u64 && self.value_size().is_some()
    }
}

/// Serialize `header` into the first [`PRIMARY_HEADER_SIZE`] bytes of `dst`.
///
/// # Panics
/// If `dst` is shorter than [`PRIMARY_HEADER_SIZE`].
pub fn serialize_primary_header(dst: &mut [u8], header: &PrimaryHeader) {
    let dst = &mut dst[..PRIMARY_HEADER_SIZE];
    dst[0..8].copy_from_slice(&header.total_size.to_le_bytes());
    dst[8..16].copy_from_slice(&header.update_time.to_le_bytes());
    dst[16..24].copy_from_slice(&header.commit_time.to_le_bytes());
    dst[24..26].copy_from_slice(&header.key_size.to_le_bytes());
    dst[26] = header.key_format;
    dst[27] = header.value_format;
    dst[28] = header.encryption_method;
    dst[29] = header.flags;
    dst[30..32].copy_from_slice(&header.secondary_header_size.to_le_bytes());
    dst[32..36].copy_from_slice(&header.header_checksum.to_le_bytes());
    dst[36..40].copy_from_slice(&header.payload_checksum.to_le_bytes());
}

/// Deserialize a primary header from the first [`PRIMARY_HEADER_SIZE`] bytes of `src`
pub fn deserialize_primary_header(src: &[u8]) -> Result<PrimaryHeader> {
    if src.len() < PRIMARY_HEADER_SIZE {
        return Err(Error::UnexpectedEof);
    }

    Ok(PrimaryHeader {
        total_size: u64::from_le_bytes(src[0..8].try_into().expect("slice is 8 bytes")),
        update_time: i64::from_le_bytes(src[8..16].try_into().expect("slice is 8 bytes")),
        commit_time: i64::from_le_bytes(src[16..24].try_into().expect("slice is 8 bytes")),
        key_size: u16::from_le_bytes([src[24], src[25]]),
        key_format: src[26],
        value_format: src[27],
        encryption_method: src[28],
        flags: src[29],
        secondary_header_size: u16::from_le_bytes([src[30], src[31]]),
        header_checksum: u32::from_le_bytes(src[32..36].try_into().expect("slice is 4 bytes")),
        payload_checksum: u32::from_le_bytes(src[36..40].try_into().expect("slice is 4 bytes")),
    })
}

/// CRC32C over the checksummed part of a serialized primary header
#[must_use]
pub fn compute_header_checksum(serialized_header: &[u8]) -> u32 {
    compute_crc32c(&serialized_header[..HEADER_CHECKSUM_COVERAGE])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> PrimaryHeader {
        PrimaryHeader {
            total_size: 1234,
            update_time: 1_600_000_000_000_000,
            commit_time: -5,
            key_size: 17,
            key_format: DataFormat::Utf8 as u8,
            value_format: DataFormat::Json as u8,
            encryption_method: 0,
            flags: flags::TRANSACTION_END,
            secondary_header_size: 0,
            header_checksum: 0xDEAD_BEEF,
            payload_checksum: 0x0BAD_F00D,
        }
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = sample_header();
        let mut buf = [0u8; PRIMARY_HEADER_SIZE];
        serialize_primary_header(&mut buf, &header);

        assert_eq!(&buf[0..8], &1234u64.to_le_bytes());
        assert_eq!(&buf[24..26], &17u16.to_le_bytes());
        assert_eq!(buf[26], 1);
        assert_eq!(buf[27], 2);
        assert_eq!(buf[29], flags::TRANSACTION_END);
        assert_eq!(&buf[32..36], &0xDEAD_BEEFu32.to_le_bytes());

        assert_eq!(deserialize_primary_header(&buf).unwrap(), header);
    }

    #[test]
    fn test_short_header_is_eof() {
        let buf = [0u8; PRIMARY_HEADER_SIZE - 1];
        assert!(matches!(
            deserialize_primary_header(&buf),
            Err(Error::UnexpectedEof)
        ));
    }

    #[test]
    fn test_size_consistency() {
        let mut header = sample_header();
        assert!(header.sizes_are_consistent());
        assert_eq!(header.key_offset(), 40);
        assert_eq!(header.value_offset(), 57);
        assert_eq!(header.value_size(), Some(1234 - 57));

        header.total_size = 50;
        assert!(!header.sizes_are_consistent());

        header.key_size = 0;
        header.total_size = 39;
        assert!(!header.sizes_are_consistent());
    }

    #[test]
    fn test_data_format_conversion() {
        assert_eq!(DataFormat::try_from(2).unwrap(), DataFormat::Json);
        assert!(DataFormat::try_from(3).is_err());
    }
}
