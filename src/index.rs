//! The table of playable entries a session serves, built by two passes over the archive.
//!
//! The first pass ([`list_playable`]) only counts. Some formats can't tell
//! whether anything is encrypted until every header has been seen, and an
//! archive with nothing to show is rejected before we commit to anything.
//! The second pass ([`build_index`]) records each playable entry and works out
//! which of them can be served straight from the mapping.

use std::ops::Range;

use chrono::NaiveDateTime;
use log::*;

use crate::decoder::{extension, ArchiveFormat, EntryHeader, EntryKind, SequentialDecoder};
use crate::mapping::Mapping;
use crate::natord;
use crate::result::*;

/// Extensions of the image formats we can display
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "jpeg", "jpg", "png", "gif", "webp", "bmp", "ico", "wbmp", "heic", "heif", "avif",
];

/// Decides which archive members are playable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    extensions: Vec<String>,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS.iter().copied())
    }
}

impl EntryFilter {
    /// Allows regular files with any of the given extensions (no leading dot).
    /// Matching is case-sensitive.
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_playable(&self, header: &EntryHeader) -> bool {
        header.kind == EntryKind::File
            && extension(header.path.as_str())
                .map_or(false, |ext| self.extensions.iter().any(|allowed| allowed == ext))
    }
}

/// One playable member of the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// The entry's full path in the archive
    pub name: String,

    /// Position among playable entries in archive order.
    /// Decoders are positioned by this, not by the entry's place in the index.
    pub stream_index: usize,

    /// Decoded size in bytes
    pub size: u64,

    pub modified: Option<NaiveDateTime>,

    /// Where the entry's bytes sit in the mapping,
    /// if they're stored there verbatim.
    pub zero_copy: Option<Range<usize>>,
}

/// What a counting pass learned about an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub playable: usize,
    /// True if any playable entry needs a passphrase
    pub encrypted: bool,
    pub format: ArchiveFormat,
}

/// Walks every header, counting playable entries.
///
/// A read error ends the scan early; whatever was counted up to that point
/// stands. If nothing was, the error is returned.
pub fn list_playable(
    decoder: &mut dyn SequentialDecoder,
    filter: &EntryFilter,
) -> ArchiveResult<ScanSummary> {
    let mut playable = 0;
    let mut encrypted = false;
    loop {
        match decoder.next_header() {
            Ok(Some(header)) => {
                if filter.is_playable(header) {
                    playable += 1;
                    encrypted |= header.encrypted;
                }
            }
            Ok(None) => break,
            Err(e) if playable > 0 => {
                warn!("Stopped scanning after {playable} playable entries: {e}");
                break;
            }
            Err(e) => return Err(e),
        }
    }
    let summary = ScanSummary {
        playable,
        encrypted,
        format: decoder.format(),
    };
    debug!("{:?}", summary);
    Ok(summary)
}

/// The session's entries, in display order
#[derive(Debug, Default)]
pub struct EntryIndex {
    pub entries: Vec<Entry>,
    /// Size of the largest entry, which every scratch buffer must hold
    pub max_entry_size: u64,
}

/// Returns the entry's range in the mapping if its first data block
/// is the whole entry, verbatim, inside the mapping.
fn zero_copy_range(
    decoder: &mut dyn SequentialDecoder,
    mapping: &Mapping,
    size: u64,
) -> Option<Range<usize>> {
    match decoder.read_data_block() {
        Ok(Some(block)) if block.offset == 0 && block.bytes.len() as u64 == size => {
            mapping.range_of(block.bytes)
        }
        Ok(_) => None,
        Err(e) => {
            debug!("Couldn't read first data block: {e}");
            None
        }
    }
}

/// Records every playable entry.
///
/// Zero-copy ranges are only looked for while every entry so far has had one.
/// The first entry that needs decoding means the whole archive does
/// (it's compressed, or read through a filter), so we stop looking.
/// Archives that mix stored and compressed members lose out; that's fine.
///
/// If `sort` is set, entries are put in natural order by name.
pub fn build_index(
    decoder: &mut dyn SequentialDecoder,
    filter: &EntryFilter,
    mapping: &Mapping,
    sort: bool,
    capacity: usize,
) -> ArchiveResult<EntryIndex> {
    let mut entries = Vec::with_capacity(capacity);
    let mut max_entry_size = 0;
    let mut try_zero_copy = true;

    loop {
        let header = match decoder.next_header() {
            Ok(Some(header)) => header,
            Ok(None) => break,
            Err(e) if !entries.is_empty() => {
                warn!("Stopped indexing after {} entries: {e}", entries.len());
                break;
            }
            Err(e) => return Err(e),
        };
        if !filter.is_playable(header) {
            continue;
        }

        let name = header.path.as_str().to_owned();
        let size = header.size;
        let modified = header.last_modified;
        let encrypted = header.encrypted;

        let zero_copy = if try_zero_copy && !encrypted {
            zero_copy_range(decoder, mapping, size)
        } else {
            None
        };
        if try_zero_copy && zero_copy.is_none() {
            debug!("{name} can't be served from the mapping; no longer trying");
            try_zero_copy = false;
        }

        max_entry_size = max_entry_size.max(size);
        entries.push(Entry {
            name,
            stream_index: entries.len(),
            size,
            modified,
            zero_copy,
        });
    }

    if entries.is_empty() {
        return Err(ArchiveError::NoPlayableEntries);
    }
    if sort {
        entries.sort_by(|a, b| natord::compare_names(&a.name, &b.name));
    }
    info!(
        "Indexed {} entries ({} zero-copy), largest is {} bytes",
        entries.len(),
        entries.iter().filter(|e| e.zero_copy.is_some()).count(),
        max_entry_size
    );
    Ok(EntryIndex {
        entries,
        max_entry_size,
    })
}

impl EntryIndex {
    /// Finds an entry by its stream index.
    pub fn by_stream_index(&self, stream_index: usize) -> Option<&Entry> {
        self.entries.iter().find(|e| e.stream_index == stream_index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::decoder::DataBlock;
    use camino::Utf8PathBuf;

    /// A decoder over canned headers, whose data is either
    /// a slice of a mapping or a copy of it.
    struct Canned {
        mapping: std::sync::Arc<Mapping>,
        headers: Vec<(EntryHeader, Range<usize>)>,
        next: usize,
        mapped: bool,
        scratch: Vec<u8>,
        fail_at: Option<usize>,
    }

    impl Canned {
        fn new(files: &[(&str, EntryKind)], mapped: bool) -> Self {
            let mut bytes = Vec::new();
            let mut headers = Vec::new();
            for (name, kind) in files {
                let start = bytes.len();
                bytes.extend_from_slice(name.as_bytes());
                let header = EntryHeader {
                    path: Utf8PathBuf::from(*name),
                    kind: *kind,
                    size: name.len() as u64,
                    encrypted: false,
                    last_modified: None,
                };
                headers.push((header, start..bytes.len()));
            }
            Self {
                mapping: std::sync::Arc::new(Mapping::from_vec(bytes)),
                headers,
                next: 0,
                mapped,
                scratch: Vec::new(),
                fail_at: None,
            }
        }
    }

    impl SequentialDecoder for Canned {
        fn next_header(&mut self) -> ArchiveResult<Option<&EntryHeader>> {
            if self.fail_at == Some(self.next) {
                return Err(ArchiveError::InvalidArchive("canned failure"));
            }
            self.next += 1;
            Ok(self.headers.get(self.next - 1).map(|(h, _)| h))
        }

        fn read_data_block(&mut self) -> ArchiveResult<Option<DataBlock<'_>>> {
            let range = self.headers[self.next - 1].1.clone();
            let bytes = &self.mapping.as_slice()[range];
            if self.mapped {
                Ok(Some(DataBlock { bytes, offset: 0 }))
            } else {
                self.scratch = bytes.to_vec();
                Ok(Some(DataBlock {
                    bytes: &self.scratch,
                    offset: 0,
                }))
            }
        }

        fn read_data(&mut self, _buf: &mut [u8]) -> ArchiveResult<usize> {
            Ok(0)
        }

        fn format(&self) -> ArchiveFormat {
            ArchiveFormat::Tar
        }
    }

    fn comic() -> Vec<(&'static str, EntryKind)> {
        vec![
            ("vol/", EntryKind::Directory),
            ("vol/a10.jpg", EntryKind::File),
            ("vol/notes.txt", EntryKind::File),
            ("vol/a2.png", EntryKind::File),
            ("vol/link.jpg", EntryKind::Symlink),
            ("vol/a1.JPG", EntryKind::File),
            ("vol/a1.gif", EntryKind::File),
        ]
    }

    #[test]
    fn test_filter() {
        let filter = EntryFilter::default();
        let header = |path: &str, kind| EntryHeader {
            path: Utf8PathBuf::from(path),
            kind,
            size: 0,
            encrypted: false,
            last_modified: None,
        };
        assert!(filter.is_playable(&header("a/b.webp", EntryKind::File)));
        assert!(filter.is_playable(&header("x.tar.avif", EntryKind::File)));
        assert!(!filter.is_playable(&header("b.PNG", EntryKind::File)));
        assert!(!filter.is_playable(&header("png", EntryKind::File)));
        assert!(!filter.is_playable(&header("dir.png", EntryKind::Directory)));

        let custom = EntryFilter::new(["txt"]);
        assert!(custom.is_playable(&header("notes.txt", EntryKind::File)));
        assert!(!custom.is_playable(&header("a.png", EntryKind::File)));
    }

    #[test]
    fn test_list_playable() {
        let mut decoder = Canned::new(&comic(), true);
        let summary = list_playable(&mut decoder, &EntryFilter::default()).unwrap();
        assert_eq!(summary.playable, 3);
        assert!(!summary.encrypted);
        assert_eq!(summary.format, ArchiveFormat::Tar);
    }

    #[test]
    fn test_list_stops_on_error() {
        let mut decoder = Canned::new(&comic(), true);
        decoder.fail_at = Some(4);
        let summary = list_playable(&mut decoder, &EntryFilter::default()).unwrap();
        assert_eq!(summary.playable, 2);

        let mut decoder = Canned::new(&comic(), true);
        decoder.fail_at = Some(0);
        assert!(list_playable(&mut decoder, &EntryFilter::default()).is_err());
    }

    #[test]
    fn test_build_sorted() {
        let mut decoder = Canned::new(&comic(), true);
        let mapping = decoder.mapping.clone();
        let index = build_index(&mut decoder, &EntryFilter::default(), &mapping, true, 3).unwrap();
        let names: Vec<_> = index.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["vol/a1.gif", "vol/a2.png", "vol/a10.jpg"]);
        let streams: Vec<_> = index.entries.iter().map(|e| e.stream_index).collect();
        assert_eq!(streams, [2, 1, 0]);
        assert_eq!(index.max_entry_size, "vol/a10.jpg".len() as u64);

        // Every entry's zero-copy range holds its own bytes.
        for entry in &index.entries {
            let range = entry.zero_copy.clone().unwrap();
            assert_eq!(&mapping.as_slice()[range], entry.name.as_bytes());
        }
        assert_eq!(index.by_stream_index(1).unwrap().name, "vol/a2.png");
    }

    #[test]
    fn test_build_unsorted_without_zero_copy() {
        let mut decoder = Canned::new(&comic(), false);
        let mapping = decoder.mapping.clone();
        let index = build_index(&mut decoder, &EntryFilter::default(), &mapping, false, 3).unwrap();
        let names: Vec<_> = index.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["vol/a10.jpg", "vol/a2.png", "vol/a1.gif"]);
        assert!(index.entries.iter().all(|e| e.zero_copy.is_none()));
    }

    #[test]
    fn test_build_nothing_playable() {
        let mut decoder = Canned::new(&[("readme.txt", EntryKind::File)], true);
        let mapping = decoder.mapping.clone();
        assert!(matches!(
            build_index(&mut decoder, &EntryFilter::default(), &mapping, false, 0),
            Err(ArchiveError::NoPlayableEntries)
        ));
    }
}
