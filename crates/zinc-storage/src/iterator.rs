//! Forward iteration over serialized entries
//!
//! [`EntryStreamIterator`] walks a byte-addressable source from `start` to
//! `end`, reading only each entry's primary header. Keys, values and
//! secondary headers are read lazily through the yielded
//! [`EntryDescriptor`], one positioned read each. Checksums are not
//! verified here; callers chain [`EntryDescriptor::verify_checksums`] when
//! they need it.

use crate::codec::{PRIMARY_HEADER_SIZE, PrimaryHeader, deserialize_primary_header};
use crate::entry::{verify_header_checksum, verify_payload_checksum};
use std::fs::File;
use std::io;
use std::sync::Arc;
use zinc_common::{Error, Result};

/// Positioned reads against a byte source
pub trait ReadAt {
    /// Fill `buf` from `offset`, failing with `UnexpectedEof` on a short read
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        std::os::unix::fs::FileExt::read_exact_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        use std::os::windows::fs::FileExt;
        while !buf.is_empty() {
            match self.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for [u8] {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::UnexpectedEof)?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.len())
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

impl ReadAt for Vec<u8> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.as_slice().read_exact_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read_exact_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        (**self).read_exact_at(buf, offset)
    }
}

/// Read `len` bytes at `offset`, mapping short reads to [`Error::UnexpectedEof`]
pub fn read_range<S: ReadAt + ?Sized>(source: &S, offset: u64, len: u64) -> Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| Error::UnexpectedEof)?;
    let mut buf = vec![0u8; len];
    source
        .read_exact_at(&mut buf, offset)
        .map_err(map_read_error)?;
    Ok(buf)
}

pub(crate) fn map_read_error(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::UnexpectedEof
    } else {
        Error::Io(e)
    }
}

/// One entry found by the iterator
pub struct EntryDescriptor<'a, S: ?Sized> {
    /// Offset of the entry within the source
    pub offset: u64,
    /// Total size of the entry
    pub size: u64,
    pub primary_header: PrimaryHeader,
    source: &'a S,
}

impl<'a, S: ReadAt + ?Sized> EntryDescriptor<'a, S> {
    /// Offset one past the last byte of this entry
    #[must_use]
    pub const fn end_offset(&self) -> u64 {
        self.offset + self.size
    }

    pub fn read_secondary_header(&self) -> Result<Vec<u8>> {
        read_range(
            self.source,
            self.offset + PRIMARY_HEADER_SIZE as u64,
            u64::from(self.primary_header.secondary_header_size),
        )
    }

    pub fn read_key(&self) -> Result<Vec<u8>> {
        read_range(
            self.source,
            self.offset + self.primary_header.key_offset(),
            u64::from(self.primary_header.key_size),
        )
    }

    pub fn read_value(&self) -> Result<Vec<u8>> {
        let value_size = self.size - self.primary_header.value_offset();
        read_range(
            self.source,
            self.offset + self.primary_header.value_offset(),
            value_size,
        )
    }

    /// Read the whole serialized entry, header included
    pub fn read_all(&self) -> Result<Vec<u8>> {
        read_range(self.source, self.offset, self.size)
    }

    /// Verify both checksums, failing with [`Error::CorruptedEntry`]
    pub fn verify_checksums(&self) -> Result<()> {
        let bytes = self.read_all()?;
        if verify_header_checksum(&bytes, &self.primary_header)
            && verify_payload_checksum(&bytes[PRIMARY_HEADER_SIZE..], &self.primary_header)
        {
            Ok(())
        } else {
            Err(Error::CorruptedEntry {
                offset: self.offset,
            })
        }
    }
}

/// Iterator over the entries in `[start, end)` of a source
pub struct EntryStreamIterator<'a, S: ?Sized> {
    source: &'a S,
    read_offset: u64,
    end: u64,
    check_transaction_end: bool,
    last_was_transaction_end: Option<bool>,
    done: bool,
}

impl<'a, S: ReadAt + ?Sized> EntryStreamIterator<'a, S> {
    /// Iterate `[start, end)`. With `check_transaction_end`, the stream must
    /// finish on an entry flagged as a transaction end, otherwise the final
    /// step yields [`Error::UnexpectedEof`].
    pub const fn new(source: &'a S, start: u64, end: u64, check_transaction_end: bool) -> Self {
        Self {
            source,
            read_offset: start,
            end,
            check_transaction_end,
            last_was_transaction_end: None,
            done: false,
        }
    }

    /// Current read position
    #[must_use]
    pub const fn read_offset(&self) -> u64 {
        self.read_offset
    }

    fn read_next(&mut self) -> Result<EntryDescriptor<'a, S>> {
        let offset = self.read_offset;
        if offset + PRIMARY_HEADER_SIZE as u64 > self.end {
            return Err(Error::UnexpectedEof);
        }

        let mut header_bytes = [0u8; PRIMARY_HEADER_SIZE];
        self.source
            .read_exact_at(&mut header_bytes, offset)
            .map_err(map_read_error)?;
        let header = deserialize_primary_header(&header_bytes)?;

        if !header.sizes_are_consistent() {
            return Err(Error::CorruptedEntry { offset });
        }
        let entry_end = offset
            .checked_add(header.total_size)
            .ok_or(Error::CorruptedEntry { offset })?;
        if entry_end > self.end {
            return Err(Error::UnexpectedEof);
        }

        self.read_offset = entry_end;
        self.last_was_transaction_end = Some(header.is_transaction_end());
        Ok(EntryDescriptor {
            offset,
            size: header.total_size,
            primary_header: header,
            source: self.source,
        })
    }
}

impl<'a, S: ReadAt + ?Sized> Iterator for EntryStreamIterator<'a, S> {
    type Item = Result<EntryDescriptor<'a, S>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.read_offset >= self.end {
            self.done = true;
            if self.check_transaction_end && self.last_was_transaction_end == Some(false) {
                return Some(Err(Error::UnexpectedEof));
            }
            return None;
        }

        let result = self.read_next();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Iterate the entries in `[start, end)` of `source`
pub const fn iterate<S: ReadAt + ?Sized>(
    source: &S,
    start: u64,
    end: u64,
    check_transaction_end: bool,
) -> EntryStreamIterator<'_, S> {
    EntryStreamIterator::new(source, start, end, check_transaction_end)
}

/// Iterator over the entries contained in a presorted list of byte ranges
pub struct RangeListIterator<'a, S: ?Sized> {
    source: &'a S,
    ranges: Vec<(u64, u64)>,
    next_range: usize,
    current: Option<EntryStreamIterator<'a, S>>,
}

impl<'a, S: ReadAt + ?Sized> RangeListIterator<'a, S> {
    #[must_use]
    pub const fn new(source: &'a S, ranges: Vec<(u64, u64)>) -> Self {
        Self {
            source,
            ranges,
            next_range: 0,
            current: None,
        }
    }
}

impl<'a, S: ReadAt + ?Sized> Iterator for RangeListIterator<'a, S> {
    type Item = Result<EntryDescriptor<'a, S>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(current) = &mut self.current {
                if let Some(item) = current.next() {
                    return Some(item);
                }
                self.current = None;
            }

            let &(start, end) = self.ranges.get(self.next_range)?;
            self.next_range += 1;
            self.current = Some(EntryStreamIterator::new(self.source, start, end, false));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flags;
    use crate::entry::{Entry, serialize_entries, serialize_entry_with_checksums};

    fn two_transactions() -> Vec<u8> {
        serialize_entries(&[
            Entry::json(r#""a""#, "1"),
            Entry::json(r#""b""#, "2").with_flags(flags::TRANSACTION_END),
            Entry::json(r#""c""#, "3").with_flags(flags::TRANSACTION_END),
        ])
    }

    #[test]
    fn test_iterates_all_entries() {
        let bytes = two_transactions();
        let descriptors: Vec<_> = iterate(&bytes, 0, bytes.len() as u64, true)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].offset, 0);
        assert_eq!(descriptors[1].offset, descriptors[0].end_offset());
        assert_eq!(descriptors[2].end_offset(), bytes.len() as u64);
        assert_eq!(descriptors[1].read_key().unwrap(), br#""b""#);
        assert_eq!(descriptors[2].read_value().unwrap(), b"3");
        assert!(descriptors[0].read_secondary_header().unwrap().is_empty());
        for d in &descriptors {
            d.verify_checksums().unwrap();
        }
    }

    #[test]
    fn test_truncated_stream_is_eof() {
        let bytes = two_transactions();
        let truncated = &bytes[..bytes.len() - 1];
        let results: Vec<_> = iterate(truncated, 0, truncated.len() as u64, false).collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[2], Err(Error::UnexpectedEof)));
    }

    #[test]
    fn test_end_bound_is_respected() {
        let bytes = two_transactions();
        let first_len = serialize_entry_with_checksums(&Entry::json(r#""a""#, "1")).len() as u64;
        let results: Vec<_> = iterate(&bytes, 0, first_len, false).collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_strict_mode_requires_transaction_end() {
        let bytes = serialize_entries(&[
            Entry::json(r#""a""#, "1").with_flags(flags::TRANSACTION_END),
            Entry::json(r#""b""#, "2"),
        ]);
        let strict: Vec<_> = iterate(&bytes, 0, bytes.len() as u64, true).collect();
        assert_eq!(strict.len(), 3);
        assert!(matches!(strict[2], Err(Error::UnexpectedEof)));

        let lenient: Vec<_> = iterate(&bytes, 0, bytes.len() as u64, false).collect();
        assert_eq!(lenient.len(), 2);
        assert!(lenient.iter().all(Result::is_ok));
    }

    #[test]
    fn test_inconsistent_sizes_are_corruption() {
        let mut bytes = serialize_entry_with_checksums(&Entry::json(r#""key""#, "1"));
        // Claim a total size smaller than the header
        bytes[0..8].copy_from_slice(&10u64.to_le_bytes());
        let results: Vec<_> = iterate(&bytes, 0, bytes.len() as u64, false).collect();
        assert!(matches!(results[0], Err(Error::CorruptedEntry { offset: 0 })));
    }

    #[test]
    fn test_empty_range() {
        let bytes = two_transactions();
        assert_eq!(iterate(&bytes, 5, 5, true).count(), 0);
    }

    #[test]
    fn test_range_list_iterator() {
        let bytes = two_transactions();
        let all: Vec<_> = iterate(&bytes, 0, bytes.len() as u64, false)
            .map(|d| {
                let d = d.unwrap();
                (d.offset, d.end_offset())
            })
            .collect();

        let ranges = vec![all[0], all[2]];
        let keys: Vec<Vec<u8>> = RangeListIterator::new(&bytes, ranges)
            .map(|d| d.unwrap().read_key().unwrap())
            .collect();
        assert_eq!(keys, vec![br#""a""#.to_vec(), br#""c""#.to_vec()]);
    }
}
