//! A forward-only cursor over tarballs, compressed or not.
//!
//! Handles ustar and old-style headers, GNU long names (type `L`),
//! and the `path` and `size` keys of PAX extended headers (type `x`).
//! Plain tarballs are read straight from the mapping, so file data
//! can be handed out without copying.

use std::io::{self, Read};
use std::ops::Range;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, NaiveDateTime};
use log::*;

use super::*;
use crate::arch::usize;
use crate::mapping::{MappedReader, Mapping};

const BLOCK: usize = 512;

/// Largest GNU long name or PAX header we'll buffer.
const MAX_METADATA_LEN: u64 = 1024 * 1024;

/// Header field ranges, per POSIX ustar
mod field {
    use std::ops::Range;

    pub const NAME: Range<usize> = 0..100;
    pub const SIZE: Range<usize> = 124..136;
    pub const MTIME: Range<usize> = 136..148;
    pub const CHECKSUM: Range<usize> = 148..156;
    pub const TYPEFLAG: usize = 156;
    pub const MAGIC: Range<usize> = 257..262;
    pub const PREFIX: Range<usize> = 345..500;
}

/// Does this look like the first header of a tarball?
pub fn looks_like_tar(bytes: &[u8]) -> bool {
    match bytes.get(..BLOCK) {
        Some(header) => &header[field::MAGIC] == b"ustar" || checksum_matches(header),
        None => false,
    }
}

/// Parses a numeric header field: NUL or space terminated octal,
/// or GNU's base-256 for values that don't fit.
fn parse_number(field: &[u8]) -> ArchiveResult<u64> {
    if let Some((&first, rest)) = field.split_first() {
        if first & 0x80 != 0 {
            let mut value = u64::from(first & 0x7f);
            for &b in rest {
                value = value
                    .checked_mul(256)
                    .and_then(|v| v.checked_add(u64::from(b)))
                    .ok_or(ArchiveError::InvalidArchive("Tar number overflows"))?;
            }
            return Ok(value);
        }
    }

    let digits = field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| b != 0 && b != b' ');
    let mut value = 0u64;
    for &b in digits {
        if !(b'0'..=b'7').contains(&b) {
            return Err(ArchiveError::InvalidArchive("Invalid octal number in tar header"));
        }
        value = value
            .checked_mul(8)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or(ArchiveError::InvalidArchive("Tar number overflows"))?;
    }
    Ok(value)
}

/// Sums the header with its checksum field counted as spaces.
/// Some old tars summed signed bytes, so we accept either.
fn checksum_matches(header: &[u8]) -> bool {
    let Ok(stored) = parse_number(&header[field::CHECKSUM]) else {
        return false;
    };
    let (mut unsigned, mut signed) = (0u64, 0i64);
    for (i, &b) in header.iter().enumerate() {
        let b = if field::CHECKSUM.contains(&i) { b' ' } else { b };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }
    stored == unsigned || i64::try_from(stored) == Ok(signed)
}

/// Bytes of zero padding after `len` bytes of data
fn padding(len: u64) -> u64 {
    (BLOCK as u64 - len % BLOCK as u64) % BLOCK as u64
}

/// `len` bytes of data plus their padding, or an error if a bogus
/// size field pushes that past what a `u64` can hold.
fn padded(len: u64) -> ArchiveResult<u64> {
    len.checked_add(padding(len))
        .ok_or(ArchiveError::InvalidArchive("Tar entry size overflows"))
}

fn c_string(bytes: &[u8]) -> &[u8] {
    let end = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Tar has no notion of name encoding; anything that isn't UTF-8
/// gets replacement characters instead of failing the whole scan.
fn lossy_path(bytes: &[u8]) -> Utf8PathBuf {
    Utf8PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

/// Pulls `path` and `size` out of a PAX extended header.
///
/// Each record is `<length> <key>=<value>\n`, where the length counts itself.
fn parse_pax(mut data: &[u8], overrides: &mut Overrides) -> ArchiveResult<()> {
    const BAD_PAX: ArchiveError = ArchiveError::InvalidArchive("Invalid PAX extended header");

    while !data.iter().all(|&b| b == 0) {
        let space = memchr::memchr(b' ', data).ok_or(BAD_PAX)?;
        let len: usize = std::str::from_utf8(&data[..space])
            .ok()
            .and_then(|l| l.parse().ok())
            .filter(|&l| l > space && l <= data.len())
            .ok_or(BAD_PAX)?;
        let record = &data[space + 1..len];
        data = &data[len..];

        let record = record.strip_suffix(b"\n").unwrap_or(record);
        let eq = memchr::memchr(b'=', record).ok_or(BAD_PAX)?;
        let (key, value) = (&record[..eq], &record[eq + 1..]);
        match key {
            b"path" => overrides.path = Some(lossy_path(value)),
            b"size" => {
                let size = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .ok_or(BAD_PAX)?;
                overrides.size = Some(size);
            }
            _ => trace!("Ignoring PAX key {}", String::from_utf8_lossy(key)),
        }
    }
    Ok(())
}

/// Metadata from extension headers, applied to the next real header
#[derive(Default)]
struct Overrides {
    path: Option<Utf8PathBuf>,
    size: Option<u64>,
}

enum Stream {
    /// An uncompressed tarball, read in place
    Mapped(MappedReader),
    /// Decompressed as we go
    Filtered(Box<dyn Read + Send>),
}

impl Stream {
    /// Reads a whole block, or returns false if the stream ended cleanly first.
    fn read_block(&mut self, block: &mut [u8; BLOCK]) -> ArchiveResult<bool> {
        let mut filled = 0;
        while filled < BLOCK {
            let n = match self {
                Stream::Mapped(r) => r.read(&mut block[filled..])?,
                Stream::Filtered(r) => match r.read(&mut block[filled..]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                },
            };
            if n == 0 {
                break;
            }
            filled += n;
        }
        match filled {
            0 => Ok(false),
            BLOCK => Ok(true),
            _ => Err(ArchiveError::InvalidArchive("Truncated tar header")),
        }
    }

    fn skip(&mut self, len: u64) -> ArchiveResult<()> {
        let skipped = match self {
            Stream::Mapped(r) => r.advance(usize(len)?) as u64,
            Stream::Filtered(r) => io::copy(&mut r.take(len), &mut io::sink())?,
        };
        if skipped == len {
            Ok(())
        } else {
            Err(ArchiveError::InvalidArchive("Truncated tar entry"))
        }
    }

    /// The given range of the mapping, if we're reading one.
    fn mapped_bytes(&self, range: Range<usize>) -> &[u8] {
        match self {
            Stream::Mapped(r) => &r.mapping().as_slice()[range],
            Stream::Filtered(_) => &[],
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> ArchiveResult<()> {
        let result = match self {
            Stream::Mapped(r) => r.read_exact(buf),
            Stream::Filtered(r) => r.read_exact(buf),
        };
        result.map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ArchiveError::InvalidArchive("Truncated tar entry"),
            _ => ArchiveError::Io(e),
        })
    }
}

/// The entry the cursor is positioned on
struct Current {
    header: EntryHeader,
    /// Data bytes not yet read
    remaining: u64,
    consumed: u64,
}

/// Walks a tarball's headers in order.
pub struct TarDecoder {
    stream: Stream,
    format: ArchiveFormat,
    current: Option<Current>,
    /// Set once we've hit the end-of-archive marker
    finished: bool,
    block: Vec<u8>,
}

impl TarDecoder {
    /// Reads an uncompressed tarball in place.
    pub fn mapped(source: Arc<Mapping>) -> Self {
        Self::with_stream(Stream::Mapped(MappedReader::new(source)), ArchiveFormat::Tar)
    }

    /// Reads a tarball out of a decompressor.
    pub fn filtered(reader: Box<dyn Read + Send>, format: ArchiveFormat) -> Self {
        Self::with_stream(Stream::Filtered(reader), format)
    }

    fn with_stream(stream: Stream, format: ArchiveFormat) -> Self {
        Self {
            stream,
            format,
            current: None,
            finished: false,
            block: Vec::new(),
        }
    }

    /// Skips whatever's left of the current entry, padding included.
    fn finish_current(&mut self) -> ArchiveResult<()> {
        if let Some(current) = self.current.take() {
            let total = current
                .remaining
                .checked_add(current.consumed)
                .ok_or(ArchiveError::InvalidArchive("Tar entry size overflows"))?;
            let skip = current
                .remaining
                .checked_add(padding(total))
                .ok_or(ArchiveError::InvalidArchive("Tar entry size overflows"))?;
            self.stream.skip(skip)?;
        }
        Ok(())
    }

    /// Reads the data of a GNU long name or PAX header.
    fn read_metadata(&mut self, len: u64) -> ArchiveResult<Vec<u8>> {
        if len > MAX_METADATA_LEN {
            return Err(ArchiveError::InvalidArchive("Tar extension header too large"));
        }
        let mut data = vec![0u8; usize(len)?];
        self.stream.read_exact(&mut data)?;
        self.stream.skip(padding(len))?;
        Ok(data)
    }
}

impl SequentialDecoder for TarDecoder {
    fn next_header(&mut self) -> ArchiveResult<Option<&EntryHeader>> {
        self.finish_current()?;
        if self.finished {
            return Ok(None);
        }

        let mut overrides = Overrides::default();
        let mut header = [0u8; BLOCK];
        let size = loop {
            if !self.stream.read_block(&mut header)? || header.iter().all(|&b| b == 0) {
                debug!("End of tar archive");
                self.finished = true;
                return Ok(None);
            }
            if !checksum_matches(&header) {
                return Err(ArchiveError::InvalidArchive("Tar header checksum mismatch"));
            }

            let size = parse_number(&header[field::SIZE])?;
            match header[field::TYPEFLAG] {
                b'L' => {
                    let name = self.read_metadata(size)?;
                    overrides.path = Some(lossy_path(c_string(&name)));
                }
                b'x' => {
                    let pax = self.read_metadata(size)?;
                    parse_pax(&pax, &mut overrides)?;
                }
                // Global PAX headers and GNU long link names don't matter to us.
                b'g' | b'K' => self.stream.skip(padded(size)?)?,
                _ => break size,
            }
        };

        let typeflag = header[field::TYPEFLAG];
        let kind = match typeflag {
            b'0' | 0 | b'7' => EntryKind::File,
            b'5' => EntryKind::Directory,
            b'2' => EntryKind::Symlink,
            _ => EntryKind::Other,
        };
        let path = overrides.path.unwrap_or_else(|| {
            let name = c_string(&header[field::NAME]);
            let prefix = c_string(&header[field::PREFIX]);
            if &header[field::MAGIC] == b"ustar" && !prefix.is_empty() {
                let mut joined = prefix.to_vec();
                joined.push(b'/');
                joined.extend_from_slice(name);
                lossy_path(&joined)
            } else {
                lossy_path(name)
            }
        });
        // Links and directories have no data, whatever the size field says.
        let data_len = match typeflag {
            b'1' | b'2' | b'3' | b'4' | b'5' | b'6' => 0,
            _ => overrides.size.unwrap_or(size),
        };
        let last_modified: Option<NaiveDateTime> = parse_number(&header[field::MTIME])
            .ok()
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc());

        let header = EntryHeader {
            // Old tars mark directories with a trailing slash.
            kind: if kind == EntryKind::File && path.as_str().ends_with('/') {
                EntryKind::Directory
            } else {
                kind
            },
            path,
            size: data_len,
            encrypted: false,
            last_modified,
        };
        trace!("{:?}", header);
        self.current = Some(Current {
            header,
            remaining: data_len,
            consumed: 0,
        });
        Ok(self.current.as_ref().map(|c| &c.header))
    }

    fn read_data_block(&mut self) -> ArchiveResult<Option<DataBlock<'_>>> {
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };
        if current.remaining == 0 {
            return Ok(None);
        }

        let in_place = match &mut self.stream {
            Stream::Mapped(reader) if current.consumed == 0 => {
                let len = usize(current.remaining)?;
                let start = reader.position();
                if reader.advance(len) != len {
                    return Err(ArchiveError::InvalidArchive("Truncated tar entry"));
                }
                current.consumed = current.remaining;
                current.remaining = 0;
                Some(start..start + len)
            }
            _ => None,
        };
        if let Some(range) = in_place {
            let bytes = self.stream.mapped_bytes(range);
            return Ok(Some(DataBlock { bytes, offset: 0 }));
        }

        let offset = current.consumed;
        let mut block = std::mem::take(&mut self.block);
        block.resize(BLOCK_SIZE, 0);
        let read = self.read_data(&mut block);
        self.block = block;
        let n = read?;
        Ok(Some(DataBlock {
            bytes: &self.block[..n],
            offset,
        }))
    }

    fn read_data(&mut self, buf: &mut [u8]) -> ArchiveResult<usize> {
        let Some(current) = self.current.as_mut() else {
            return Ok(0);
        };
        let len = buf.len().min(usize::try_from(current.remaining).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(0);
        }
        self.stream.read_exact(&mut buf[..len])?;
        current.remaining -= len as u64;
        current.consumed += len as u64;
        Ok(len)
    }

    fn format(&self) -> ArchiveFormat {
        self.format
    }
}


#[cfg(test)]
mod test {
    use super::fixtures::*;
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use std::io::Write;

    fn sample() -> Vec<u8> {
        let long_name = format!("{}/c.gif", "d".repeat(120));
        let mut tar = Vec::new();
        push_entry(&mut tar, "pages/", b'5', b"");
        push_entry(&mut tar, "pages/a.png", b'0', b"not really a png");
        push_entry(&mut tar, "././@LongLink", b'L', format!("{long_name}\0").as_bytes());
        push_entry(&mut tar, "truncated", b'0', b"gif");
        let pax = "18 path=pax/b.jpg\n";
        push_entry(&mut tar, "PaxHeaders/b.jpg", b'x', pax.as_bytes());
        push_entry(&mut tar, "b.jpg", b'0', &[7u8; 700]);
        tar.extend_from_slice(&[0u8; BLOCK * 2]);
        tar
    }

    fn collect(decoder: &mut dyn SequentialDecoder) -> Vec<(EntryHeader, Vec<u8>)> {
        let mut entries = Vec::new();
        while let Some(header) = decoder.next_header().unwrap() {
            let header = header.clone();
            let mut data = Vec::new();
            while let Some(block) = decoder.read_data_block().unwrap() {
                assert_eq!(block.offset, data.len() as u64);
                data.extend_from_slice(block.bytes);
            }
            entries.push((header, data));
        }
        entries
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_number(b"0000644\0").unwrap(), 0o644);
        assert_eq!(parse_number(b"  17 \0").unwrap(), 0o17);
        assert_eq!(parse_number(b"\0\0\0").unwrap(), 0);
        assert_eq!(parse_number(&[0x80, 0, 0, 1, 0]).unwrap(), 256);
        assert!(parse_number(b"0009").is_err());
    }

    #[test]
    fn test_looks_like_tar() {
        assert!(looks_like_tar(&sample()));
        assert!(!looks_like_tar(&[0u8; BLOCK]));
        assert!(!looks_like_tar(b"short"));
    }

    #[test]
    fn test_pax_records() {
        let mut overrides = Overrides::default();
        parse_pax(b"16 path=a/b.png\n11 size=42\n12 mtime=17\n", &mut overrides).unwrap();
        assert_eq!(overrides.path.unwrap().as_str(), "a/b.png");
        assert_eq!(overrides.size, Some(42));
        assert!(parse_pax(b"99 path=x\n", &mut Overrides::default()).is_err());
    }

    #[test]
    fn test_walk_mapped() {
        let mapping = Arc::new(Mapping::from_vec(sample()));
        let mut decoder = TarDecoder::mapped(mapping.clone());
        let entries = collect(&mut decoder);
        let names: Vec<_> = entries.iter().map(|(h, _)| h.path.as_str()).collect();
        let long_name = format!("{}/c.gif", "d".repeat(120));
        assert_eq!(
            names,
            ["pages/", "pages/a.png", long_name.as_str(), "pax/b.jpg"]
        );
        assert_eq!(entries[0].0.kind, EntryKind::Directory);
        assert_eq!(entries[1].1, b"not really a png");
        assert_eq!(entries[2].1, b"gif");
        assert_eq!(entries[3].1, vec![7u8; 700]);
        assert!(entries[3].0.last_modified.is_some());
        assert!(decoder.next_header().unwrap().is_none());
    }

    #[test]
    fn test_mapped_blocks_point_into_mapping() {
        let mapping = Arc::new(Mapping::from_vec(sample()));
        let mut decoder = TarDecoder::mapped(mapping.clone());
        decoder.next_header().unwrap();
        decoder.next_header().unwrap();
        let block = decoder.read_data_block().unwrap().unwrap();
        assert_eq!(block.bytes.len(), 16);
        assert!(mapping.contains(block.bytes.as_ptr()));
    }

    #[test]
    fn test_walk_gzip() {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&sample()).unwrap();
        let compressed = gz.finish().unwrap();
        let reader = Box::new(flate2::read::MultiGzDecoder::new(io::Cursor::new(compressed)));
        let mut decoder = TarDecoder::filtered(reader, ArchiveFormat::TarGzip);
        let entries = collect(&mut decoder);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].0.path.as_str(), "pax/b.jpg");
        assert_eq!(entries[3].1, vec![7u8; 700]);
        assert_eq!(decoder.format(), ArchiveFormat::TarGzip);
    }

    #[test]
    fn test_skip_partially_read() {
        let mapping = Arc::new(Mapping::from_vec(sample()));
        let mut decoder = TarDecoder::mapped(mapping);
        decoder.next_header().unwrap();
        decoder.next_header().unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(decoder.read_data(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"not");
        let next = decoder.next_header().unwrap().unwrap();
        assert!(next.path.as_str().ends_with("c.gif"));
    }

    #[test]
    fn test_bad_checksum() {
        let mut tar = sample();
        tar[0] ^= 0x20;
        let mut decoder = TarDecoder::mapped(Arc::new(Mapping::from_vec(tar)));
        assert!(matches!(
            decoder.next_header(),
            Err(ArchiveError::InvalidArchive(_))
        ));
    }

    #[test]
    fn test_huge_size_is_an_error() {
        let mut h = header("huge.jpg", b'0', 0);
        h[field::SIZE].copy_from_slice(&[0x80, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        set_checksum(&mut h);
        let mut tar = h.to_vec();
        tar.extend_from_slice(&[0u8; BLOCK * 2]);

        let mut decoder = TarDecoder::mapped(Arc::new(Mapping::from_vec(tar)));
        assert_eq!(decoder.next_header().unwrap().unwrap().size, u64::MAX);
        assert!(matches!(
            decoder.next_header(),
            Err(ArchiveError::InvalidArchive(_))
        ));
    }

    #[test]
    fn test_huge_global_header_is_an_error() {
        let mut h = header("pax_global_header", b'g', 0);
        h[field::SIZE].copy_from_slice(&[0x80, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        set_checksum(&mut h);
        let mut tar = h.to_vec();
        tar.extend_from_slice(&[0u8; BLOCK * 2]);

        let mut decoder = TarDecoder::mapped(Arc::new(Mapping::from_vec(tar)));
        assert!(matches!(
            decoder.next_header(),
            Err(ArchiveError::InvalidArchive(_))
        ));
    }
}
