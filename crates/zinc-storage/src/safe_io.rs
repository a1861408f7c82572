//! Safe file replacement and shared descriptors
//!
//! Datastore files are never rewritten in place. A new version is written
//! to a `.partial-<us>` sibling, synced, then renamed over the original, so
//! a crash leaves either the old or the new file. Deletion goes through a
//! `.deleted-<us>` rename for the same reason.
//!
//! Open descriptors are tracked in a process-wide registry. A [`FileGuard`]
//! holds one reference: cloning increments, dropping decrements, and the
//! descriptor is closed when the count reaches zero. Anything that may
//! outlive the currently published datastore state (a background flush, an
//! in-flight reader) holds its own guard.

use crate::iterator::{ReadAt, map_read_error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};
use zinc_common::time::now_us;
use zinc_common::{Error, Result};

#[cfg(windows)]
const FILE_SHARE_READ_WRITE_DELETE: u32 = 0x1 | 0x2 | 0x4;

/// Path of a temporary sibling: `<path>.<tag>-<now_us>`
#[must_use]
pub fn sibling_path(path: &Path, tag: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".{tag}-{}", now_us()));
    PathBuf::from(name)
}

/// Open options allowing the file to be renamed or deleted while open
fn shared_open_options(write: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.read(true).write(write);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(FILE_SHARE_READ_WRITE_DELETE);
    }
    options
}

/// Atomically replace (or create) `path` with the contents of `reader`
pub fn create_or_rewrite_file_safe(path: &Path, reader: &mut dyn Read) -> Result<()> {
    let temp_path = sibling_path(path, "partial");

    let written = (|| -> io::Result<()> {
        let mut options = shared_open_options(true);
        options.create_new(true);
        let mut file = options.open(&temp_path)?;
        io::copy(reader, &mut file)?;
        file.flush()?;
        file.sync_all()
    })();

    if let Err(e) = written.and_then(|()| replace_file(&temp_path, path)) {
        if let Err(cleanup) = fs::remove_file(&temp_path)
            && cleanup.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove temporary file {:?}: {}", temp_path, cleanup);
        }
        return Err(Error::Io(e));
    }

    sync_parent_dir(path);
    debug!("Rewrote {:?}", path);
    Ok(())
}

#[cfg(not(windows))]
fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)
}

#[cfg(windows)]
fn replace_file(from: &Path, to: &Path) -> io::Result<()> {
    let old_path = sibling_path(to, "old");
    let had_target = match fs::rename(to, &old_path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };
    fs::rename(from, to)?;
    if had_target && let Err(e) = fs::remove_file(&old_path) {
        warn!("Failed to remove {:?}: {}", old_path, e);
    }
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        && let Err(e) = File::open(parent).and_then(|dir| dir.sync_all())
    {
        debug!("Failed to sync directory {:?}: {}", parent, e);
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// Delete `path` by renaming it to a `.deleted-<us>` sibling first
pub fn unlink_file_safe(path: &Path) -> Result<()> {
    let deleted_path = sibling_path(path, "deleted");
    fs::rename(path, &deleted_path)?;
    fs::remove_file(&deleted_path)?;
    Ok(())
}

/// Process-wide descriptor id -> reference count
struct DescriptorRegistry {
    counts: Mutex<HashMap<u64, usize>>,
    next_id: AtomicU64,
}

static REGISTRY: LazyLock<DescriptorRegistry> = LazyLock::new(|| DescriptorRegistry {
    counts: Mutex::new(HashMap::new()),
    next_id: AtomicU64::new(1),
});

impl DescriptorRegistry {
    fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counts.lock().insert(id, 1);
        id
    }

    fn increment(&self, id: u64) {
        let mut counts = self.counts.lock();
        let count = counts
            .get_mut(&id)
            .unwrap_or_else(|| panic!("descriptor {id} incremented after being closed"));
        *count += 1;
    }

    /// Returns the remaining count
    fn decrement(&self, id: u64) -> usize {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(&id) else {
            panic!("descriptor {id} decremented below zero");
        };
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            counts.remove(&id);
        }
        remaining
    }

    fn count(&self, id: u64) -> usize {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }

    fn open_descriptors(&self) -> usize {
        self.counts.lock().len()
    }
}

/// Number of descriptors currently held open through the registry
#[must_use]
pub fn open_descriptor_count() -> usize {
    REGISTRY.open_descriptors()
}

/// A counted reference to a shared, open datastore file
pub struct FileGuard {
    id: u64,
    file: Arc<File>,
    path: Arc<PathBuf>,
}

impl FileGuard {
    /// Open `path` for reading and writing with delete-sharing semantics and
    /// register it with a reference count of one
    pub fn open_and_increment(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = shared_open_options(true).open(path)?;
        Ok(Self {
            id: REGISTRY.register(),
            file: Arc::new(file),
            path: Arc::new(path.to_path_buf()),
        })
    }

    /// Take another reference to the same descriptor
    #[must_use]
    pub fn increment(&self) -> Self {
        self.clone()
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Current reference count of this descriptor
    #[must_use]
    pub fn ref_count(&self) -> usize {
        REGISTRY.count(self.id)
    }

    /// Size of the file on disk
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Write all of `buf` at `offset`
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::FileExt::write_all_at(&*self.file, buf, offset)?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut written = 0usize;
            while written < buf.len() {
                let n = self
                    .file
                    .seek_write(&buf[written..], offset + written as u64)?;
                if n == 0 {
                    return Err(Error::Io(io::ErrorKind::WriteZero.into()));
                }
                written += n;
            }
        }
        Ok(())
    }

    /// Truncate the file to `size` bytes
    pub fn set_len(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    /// Flush file contents to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Clone for FileGuard {
    fn clone(&self) -> Self {
        REGISTRY.increment(self.id);
        Self {
            id: self.id,
            file: Arc::clone(&self.file),
            path: Arc::clone(&self.path),
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        if REGISTRY.decrement(self.id) == 0 {
            debug!("Closing descriptor {} for {:?}", self.id, self.path);
        }
    }
}

impl std::fmt::Debug for FileGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileGuard")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl ReadAt for FileGuard {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }
}

/// `io::Read` over `[start, end)` of a source
pub struct RangeReader<S> {
    source: S,
    position: u64,
    end: u64,
}

impl<S: ReadAt> RangeReader<S> {
    pub const fn new(source: S, start: u64, end: u64) -> Self {
        Self {
            source,
            position: start,
            end,
        }
    }

    /// Bytes left to read
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.position)
    }

    /// Read everything that is left into a vector
    pub fn read_to_vec(mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.remaining()).map_err(|_| Error::UnexpectedEof)?;
        let mut buf = vec![0u8; len];
        self.source
            .read_exact_at(&mut buf, self.position)
            .map_err(map_read_error)?;
        self.position = self.end;
        Ok(buf)
    }
}

impl<S: ReadAt> Read for RangeReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = usize::try_from(self.remaining())
            .unwrap_or(usize::MAX)
            .min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        self.source.read_exact_at(&mut buf[..n], self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}

/// `io::Read` over the concatenation of a list of ranges of a source
pub struct RangeListReader<S> {
    source: S,
    ranges: Vec<(u64, u64)>,
    current: usize,
    position: u64,
}

impl<S: ReadAt> RangeListReader<S> {
    pub fn new(source: S, ranges: Vec<(u64, u64)>) -> Self {
        let position = ranges.first().map_or(0, |r| r.0);
        Self {
            source,
            ranges,
            current: 0,
            position,
        }
    }

    /// Total number of bytes this reader produces
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }
}

impl<S: ReadAt> Read for RangeListReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(&(_, end)) = self.ranges.get(self.current) {
            if self.position >= end {
                self.current += 1;
                if let Some(&(next_start, _)) = self.ranges.get(self.current) {
                    self.position = next_start;
                }
                continue;
            }

            let n = usize::try_from(end - self.position)
                .unwrap_or(usize::MAX)
                .min(buf.len());
            if n == 0 {
                return Ok(0);
            }
            self.source.read_exact_at(&mut buf[..n], self.position)?;
            self.position += n as u64;
            return Ok(n);
        }
        Ok(0)
    }
}
