//! The read-only view of an archive's bytes that every decoder shares.
//!
//! Large archives should be memory mapped: on 64-bit systems this lets us
//! treat the archive as one contiguous byte range even when it's much larger
//! than physical RAM, and stored entries can then be served straight out of
//! the mapping without copying them anywhere.
//! Smaller archives that are already in memory work just as well.

use std::fs::File;
use std::io;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use log::*;
use memmap2::{Mmap, MmapOptions};

use crate::arch::usize;
use crate::decoder::ArchiveFormat;
use crate::result::*;

enum Backing {
    Mapped(Mmap),
    Memory(Vec<u8>),
}

/// An archive's bytes, mapped from a file or owned in memory.
///
/// Immutable for its whole lifetime. Unmapped when the last
/// [`Arc`] to it (held by the session and each decoder) is dropped.
pub struct Mapping {
    backing: Backing,
}

impl Mapping {
    /// Maps the first `len` bytes of `file` read-only.
    pub fn open(file: &File, len: u64) -> ArchiveResult<Self> {
        let len = usize(len)?;
        // SAFETY: The mapping is read-only and private to us;
        // like every mmap-based reader we assume the file isn't truncated
        // out from under us while the session is open.
        let mmap = unsafe { MmapOptions::new().len(len).map(file) }.map_err(|e| {
            error!("mmap failed with error {e}");
            ArchiveError::MapFailed(e)
        })?;
        debug!("Mapped {} bytes", mmap.len());
        Ok(Self {
            backing: Backing::Mapped(mmap),
        })
    }

    /// Opens and maps the whole file at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> ArchiveResult<Self> {
        let path = path.as_ref();
        info!("Memory mapping {}", path.display());
        let file = File::open(path).map_err(ArchiveError::MapFailed)?;
        let len = file.metadata().map_err(ArchiveError::MapFailed)?.len();
        Self::open(&file, len)
    }

    /// Wraps an archive that's already in memory.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            backing: Backing::Memory(bytes),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(m) => m,
            Backing::Memory(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `ptr` points into this mapping.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.as_slice().as_ptr_range().contains(&ptr)
    }

    /// If `slice` lies entirely inside this mapping, returns its byte range.
    pub fn range_of(&self, slice: &[u8]) -> Option<Range<usize>> {
        if slice.is_empty() || !self.contains(slice.as_ptr()) {
            return None;
        }
        let start = slice.as_ptr() as usize - self.as_slice().as_ptr() as usize;
        let end = start + slice.len();
        (end <= self.len()).then_some(start..end)
    }

    /// Hints the kernel about how decoders of `format` will walk the mapping.
    ///
    /// Purely an optimization; failures are logged and otherwise ignored.
    pub fn advise(&self, format: ArchiveFormat) {
        if let Backing::Mapped(m) = &self.backing {
            advise_mapping(m, format);
        }
    }
}

#[cfg(unix)]
fn advise_mapping(mapping: &Mmap, format: ArchiveFormat) {
    use memmap2::Advice;

    let advice = match format {
        ArchiveFormat::Zip | ArchiveFormat::Rar => Advice::Sequential,
        // Entries are decoded out of folders scattered across the file.
        ArchiveFormat::SevenZip => Advice::Random,
        ArchiveFormat::Tar | ArchiveFormat::TarGzip | ArchiveFormat::TarXz => return,
    };
    if let Err(e) = mapping.advise(advice) {
        warn!("madvise({advice:?}) failed: {e}");
    }
}

#[cfg(not(unix))]
fn advise_mapping(_mapping: &Mmap, _format: ArchiveFormat) {}

/// An owning reader over a range of a shared [`Mapping`].
///
/// Decoders hold one of these instead of borrowing the mapping,
/// so they can live in a pool next to it.
pub struct MappedReader {
    source: Arc<Mapping>,
    start: usize,
    position: usize,
    end: usize,
}

impl MappedReader {
    /// Reads the whole mapping.
    pub fn new(source: Arc<Mapping>) -> Self {
        let end = source.len();
        Self::with_range(source, 0..end)
    }

    pub fn with_range(source: Arc<Mapping>, range: Range<usize>) -> Self {
        let end = range.end.min(source.len());
        let start = range.start.min(end);
        Self {
            source,
            start,
            position: start,
            end,
        }
    }

    /// The bytes not yet read.
    pub fn remaining(&self) -> &[u8] {
        &self.source.as_slice()[self.position..self.end]
    }

    pub fn mapping(&self) -> &Mapping {
        &self.source
    }

    /// Absolute offset of the next byte in the mapping.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Skips up to `n` bytes, returning how many were skipped.
    pub fn advance(&mut self, n: usize) -> usize {
        let n = n.min(self.end - self.position);
        self.position += n;
        n
    }
}

impl io::Read for MappedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

/// Seeks are relative to the start of the reader's range,
/// so a backend handed a slice of the mapping sees it as a whole file.
impl io::Seek for MappedReader {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            io::SeekFrom::Start(n) => (self.start as u64, i64::try_from(n).ok()),
            io::SeekFrom::End(n) => (self.end as u64, Some(n)),
            io::SeekFrom::Current(n) => (self.position as u64, Some(n)),
        };
        let target = delta
            .and_then(|d| base.checked_add_signed(d))
            .filter(|&t| t >= self.start as u64)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "seek outside the mapped range")
            })?;
        // Seeking past the end is allowed; reads there just come back empty.
        self.position = usize::try_from(target)
            .unwrap_or(usize::MAX)
            .min(self.end);
        Ok(target - self.start as u64)
    }
}
