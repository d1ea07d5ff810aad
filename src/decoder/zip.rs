//! A forward-only cursor over a ZIP archive.
//!
//! Zip is random access at heart: a central directory at the back tells us
//! where every file lives. Walking that directory in order gives us the same
//! sequential view every other format has, and each stored (uncompressed,
//! unencrypted) file is just a range of the mapping we can hand out as-is.

use std::io::{self, Read};
use std::ops::Range;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::NaiveDateTime;
use flate2::read::DeflateDecoder;
use log::*;

use super::crc_reader::Crc32Reader;
use super::spec;
use super::zipcrypto::ZipCryptoReader;
use super::*;
use crate::arch::usize;
use crate::mapping::{MappedReader, Mapping};

/// The compression method used to store a file
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The file is uncompressed
    None,
    /// The file is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The file is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// Compression method 99 marks WinZip AES encryption.
const AES_METHOD: u16 = 99;

/// Metadata for a file or directory in the archive,
/// retrieved from its central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipEntry {
    /// Uncompressed size of the file in bytes
    pub size: u64,

    /// Compressed size of the file in bytes
    pub compressed_size: u64,

    /// Compression algorithm used to store the file
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the decompressed file
    pub crc32: u32,

    /// General purpose bit flags
    pub flags: u16,

    /// True if the file is encrypted
    pub encrypted: bool,

    /// The provided path of the file.
    pub path: Utf8PathBuf,

    /// Raw MS-DOS modification time, which doubles as the password check
    /// for encrypted entries with data descriptors.
    pub last_modified_time: u16,

    /// The ISO 8601 combined date and time the file was last modified
    pub last_modified: Option<NaiveDateTime>,

    /// Unix mode bits, if the file was archived in a Unix OS.
    pub unix_mode: Option<u16>,

    /// The offset to the local file header in the archive
    pub(crate) header_offset: u64,
}

impl ZipEntry {
    pub fn kind(&self) -> EntryKind {
        const S_IFMT: u16 = 0o170000;
        const S_IFREG: u16 = 0o100000;
        const S_IFDIR: u16 = 0o040000;
        const S_IFLNK: u16 = 0o120000;

        // Path::ends_with() doesn't consider separators,
        // so we need a different approach.
        let slashed = self.path.as_str().ends_with('/');
        match self.unix_mode.map(|mode| mode & S_IFMT) {
            Some(S_IFDIR) => EntryKind::Directory,
            Some(S_IFLNK) => EntryKind::Symlink,
            Some(S_IFREG) | Some(0) | None if slashed => EntryKind::Directory,
            Some(S_IFREG) | Some(0) | None => EntryKind::File,
            Some(_) => EntryKind::Other,
        }
    }

    /// The byte the last byte of a decrypted encryption header must match.
    fn check_byte(&self) -> u8 {
        if self.has_data_descriptor() {
            (self.last_modified_time >> 8) as u8
        } else {
            (self.crc32 >> 24) as u8
        }
    }

    fn header(&self) -> EntryHeader {
        EntryHeader {
            path: self.path.clone(),
            kind: self.kind(),
            size: self.size,
            encrypted: self.encrypted,
            last_modified: self.last_modified,
        }
    }
}

/// Parses the central directory, returning its entries and
/// the number of bytes prepended to the archive.
///
/// Zip files can be prepended by arbitrary junk (self-extractors, for one),
/// so all the stored positions might be off.
fn read_central_directory(mapping: &[u8]) -> ArchiveResult<(Vec<ZipEntry>, usize)> {
    let eocdr_posit = spec::find_eocdr(mapping)?;
    let eocdr = spec::EndOfCentralDirectory::parse(&mapping[eocdr_posit..])?;
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory
        || eocdr.entries != eocdr.entries_on_this_disk
    {
        return Err(ArchiveError::UnsupportedArchive(String::from(
            "No support for multi-disk archives",
        )));
    }

    let nominal_central_directory_offset: usize;
    let entry_count: u64;
    let archive_offset;

    let locator = eocdr_posit
        .checked_sub(spec::Zip64EndOfCentralDirectoryLocator::size_in_file())
        .and_then(|posit| spec::Zip64EndOfCentralDirectoryLocator::parse(&mapping[posit..]));
    if let Some(zip64_eocdr_locator) = locator {
        trace!("{:?}", zip64_eocdr_locator);

        if eocdr.disk_number as u32 != zip64_eocdr_locator.disk_with_central_directory
            || zip64_eocdr_locator.disks != 1
        {
            return Err(ArchiveError::UnsupportedArchive(String::from(
                "No support for multi-disk Zip64 archives",
            )));
        }

        // Search for the zip64 EOCDR, from its nominal starting position
        // to the end of where it could be.
        let search_start = usize(zip64_eocdr_locator.zip64_eocdr_offset)?;
        let search_end = eocdr_posit - spec::Zip64EndOfCentralDirectoryLocator::size_in_file();
        let search_space = mapping.get(search_start..search_end).ok_or(
            ArchiveError::InvalidArchive("Invalid Zip64 End Of Central Directory Locator"),
        )?;

        let zip64_eocdr_posit = spec::find_zip64_eocdr(search_space)?;
        // Since we're searching starting at the provided offset,
        // the returned position is the archive offset.
        archive_offset = zip64_eocdr_posit;
        let zip64_eocdr = spec::Zip64EndOfCentralDirectory::parse(&search_space[zip64_eocdr_posit..])?;
        trace!("{:?}", zip64_eocdr);

        nominal_central_directory_offset = usize(zip64_eocdr.central_directory_offset)?;
        entry_count = zip64_eocdr.entries;
    } else {
        // The offset is the actual position versus the stored one.
        let actual_cdr_posit = eocdr_posit.checked_sub(usize(eocdr.central_directory_size)?);
        let nominal_offset = usize(eocdr.central_directory_offset)?;
        archive_offset = actual_cdr_posit
            .and_then(|off| off.checked_sub(nominal_offset))
            .ok_or(ArchiveError::InvalidArchive(
                "Invalid central directory size or offset",
            ))?;
        nominal_central_directory_offset = nominal_offset;
        entry_count = eocdr.entries as u64;
    }

    if archive_offset != 0 {
        debug!("Archive prepended with {archive_offset} unknown bytes");
    }
    trace!(
        "{} entries at nominal offset {}",
        entry_count,
        nominal_central_directory_offset
    );

    let mut central_directory = archive_offset
        .checked_add(nominal_central_directory_offset)
        .and_then(|start| mapping.get(start..))
        .ok_or(ArchiveError::InvalidArchive(
            "Central directory offset out of bounds",
        ))?;

    // Don't trust the count for the allocation; each entry takes at least 46 bytes.
    let plausible = usize(entry_count)?.min(central_directory.len() / 46);
    let mut entries = Vec::with_capacity(plausible);

    for _ in 0..entry_count {
        let dir_entry = spec::CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
        trace!("{:?}", dir_entry);

        let entry = ZipEntry::from_cde(&dir_entry)?;
        debug!("{:?}", entry);
        entries.push(entry);
    }

    Ok((entries, archive_offset))
}

/// Checks a local file header against its central directory entry.
fn check_local_header(entry: &ZipEntry, local: &spec::LocalFileHeader) -> ArchiveResult<()> {
    let path = spec::decode_path(local.path, local.flags)?;
    let mut matches =
        path == entry.path && method_code(entry.compression_method) == local.compression_method;
    // With a data descriptor the sizes and CRC here are zero,
    // and Zip64 entries keep theirs in the extra field.
    if !local.has_data_descriptor()
        && local.compressed_size != u32::MAX
        && local.uncompressed_size != u32::MAX
    {
        matches = matches
            && local.crc32 == entry.crc32
            && u64::from(local.compressed_size) == entry.compressed_size
            && u64::from(local.uncompressed_size) == entry.size;
    }
    if matches {
        Ok(())
    } else {
        Err(ArchiveError::InvalidArchive(
            "Central directory entry doesn't match local file header",
        ))
    }
}

fn method_code(method: CompressionMethod) -> u16 {
    match method {
        CompressionMethod::None => 0,
        CompressionMethod::Deflate => 8,
        CompressionMethod::Unsupported(v) => v,
    }
}

/// True if the entry's bytes in the archive are exactly its contents.
fn is_verbatim(entry: &ZipEntry, options: &DecoderOptions) -> bool {
    entry.compression_method == CompressionMethod::None && !entry.encrypted && !options.verify_crc
}

/// Returns a reader for an entry's data, given its raw (compressed,
/// possibly encrypted) bytes.
fn make_reader(
    entry: &ZipEntry,
    raw: MappedReader,
    options: &DecoderOptions,
) -> ArchiveResult<Box<dyn io::Read + Send>> {
    if let CompressionMethod::Unsupported(v) = entry.compression_method {
        return Err(ArchiveError::UnsupportedArchive(if v == AES_METHOD {
            format!("Can't read AES-encrypted file {}", entry.path)
        } else {
            format!("Compression method {v} not supported ({})", entry.path)
        }));
    }

    let decrypted: Box<dyn io::Read + Send> = if entry.encrypted {
        let password = options
            .passphrase
            .as_deref()
            .ok_or(ArchiveError::PasswordRequired)?;
        Box::new(ZipCryptoReader::new(
            raw,
            password.as_bytes(),
            entry.check_byte(),
        )?)
    } else {
        Box::new(raw)
    };

    let decoded: Box<dyn io::Read + Send> = match entry.compression_method {
        CompressionMethod::Deflate => Box::new(DeflateDecoder::new(decrypted)),
        _ => decrypted,
    };

    if options.verify_crc {
        Ok(Box::new(Crc32Reader::new(decoded, entry.crc32)))
    } else {
        Ok(decoded)
    }
}

enum Body {
    /// Nothing has been read yet.
    Unopened,
    Open(Box<dyn io::Read + Send>),
    /// Handed out whole, or read to the end.
    Done,
}

/// The entry the cursor is positioned on
struct Current {
    header: EntryHeader,
    /// Index into `ZipDecoder::entries`
    entry: usize,
    /// Where the entry's raw data sits in the mapping
    data: Range<usize>,
    body: Body,
    consumed: u64,
}

/// Walks a ZIP archive's entries in central directory order.
pub struct ZipDecoder {
    source: Arc<Mapping>,
    archive_offset: usize,
    entries: Vec<ZipEntry>,
    next: usize,
    current: Option<Current>,
    options: DecoderOptions,
    block: Vec<u8>,
}

impl ZipDecoder {
    pub fn new(source: Arc<Mapping>, options: DecoderOptions) -> ArchiveResult<Self> {
        let (entries, archive_offset) =
            read_central_directory(source.as_slice()).map_err(|e| match e {
                ArchiveError::UnsupportedArchive(_) => e,
                other => ArchiveError::DecoderOpenFailed(other.to_string()),
            })?;
        debug!("Zip archive with {} entries", entries.len());
        Ok(Self {
            source,
            archive_offset,
            entries,
            next: 0,
            current: None,
            options,
            block: Vec::new(),
        })
    }

    /// The entries from the central directory, in archive order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Finds the raw data of `entry` by way of its local file header.
    fn locate_data(&self, entry: &ZipEntry) -> ArchiveResult<Range<usize>> {
        let header_posit = usize(entry.header_offset)?
            .checked_add(self.archive_offset)
            .ok_or(ArchiveError::InvalidArchive("Local file header offset overflows"))?;
        let mut file_slice = self.source.as_slice().get(header_posit..).ok_or(
            ArchiveError::InvalidArchive("Local file header offset out of bounds"),
        )?;
        let before = file_slice.len();
        let local_header = spec::LocalFileHeader::parse_and_consume(&mut file_slice)?;
        trace!("{:?}", local_header);
        if cfg!(feature = "check-local-metadata") {
            check_local_header(entry, &local_header)?;
        }

        let start = header_posit + (before - file_slice.len());
        let end = start
            .checked_add(usize(entry.compressed_size)?)
            .filter(|end| *end <= self.source.len())
            .ok_or(ArchiveError::InvalidArchive(
                "File data runs past the end of the archive",
            ))?;
        Ok(start..end)
    }
}

impl SequentialDecoder for ZipDecoder {
    fn next_header(&mut self) -> ArchiveResult<Option<&EntryHeader>> {
        self.current = None;
        let index = self.next;
        let Some(entry) = self.entries.get(index) else {
            return Ok(None);
        };
        let data = self.locate_data(entry)?;
        let header = entry.header();
        self.next += 1;
        self.current = Some(Current {
            header,
            entry: index,
            data,
            body: Body::Unopened,
            consumed: 0,
        });
        Ok(self.current.as_ref().map(|c| &c.header))
    }

    fn read_data_block(&mut self) -> ArchiveResult<Option<DataBlock<'_>>> {
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };
        if matches!(current.body, Body::Unopened)
            && is_verbatim(&self.entries[current.entry], &self.options)
        {
            current.body = Body::Done;
            let bytes = &self.source.as_slice()[current.data.clone()];
            if bytes.is_empty() {
                return Ok(None);
            }
            current.consumed = bytes.len() as u64;
            return Ok(Some(DataBlock { bytes, offset: 0 }));
        }

        let offset = current.consumed;
        let mut block = std::mem::take(&mut self.block);
        block.resize(BLOCK_SIZE, 0);
        let read = self.read_data(&mut block);
        self.block = block;
        let n = read?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(DataBlock {
            bytes: &self.block[..n],
            offset,
        }))
    }

    fn read_data(&mut self, buf: &mut [u8]) -> ArchiveResult<usize> {
        let Some(current) = self.current.as_mut() else {
            return Ok(0);
        };
        if matches!(current.body, Body::Unopened) {
            let entry = &self.entries[current.entry];
            let raw = MappedReader::with_range(self.source.clone(), current.data.clone());
            current.body = Body::Open(make_reader(entry, raw, &self.options)?);
        }
        let n = match &mut current.body {
            Body::Open(reader) => reader.read(buf)?,
            Body::Unopened | Body::Done => 0,
        };
        if n == 0 && !buf.is_empty() {
            current.body = Body::Done;
        }
        current.consumed += n as u64;
        Ok(n)
    }

    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a zip of stored entries.
    fn stored_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut central = Vec::new();
        for (name, data) in files {
            let offset = out.len() as u32;
            let crc = crc32fast::hash(data);
            let len = data.len() as u32;

            out.extend_from_slice(b"PK\x03\x04");
            out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0x21, 0]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(data);

            central.extend_from_slice(b"PK\x01\x02");
            central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0x21, 0]);
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&len.to_le_bytes());
            central.extend_from_slice(&len.to_le_bytes());
            central.extend_from_slice(&(name.len() as u16).to_le_bytes());
            central.extend_from_slice(&[0; 12]);
            central.extend_from_slice(&offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }
        let central_offset = out.len() as u32;
        out.extend_from_slice(&central);
        out.extend_from_slice(b"PK\x05\x06\0\0\0\0");
        out.extend_from_slice(&(files.len() as u16).to_le_bytes());
        out.extend_from_slice(&(files.len() as u16).to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&central_offset.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out
    }

    fn decoder_for(bytes: Vec<u8>, options: DecoderOptions) -> (Arc<Mapping>, ZipDecoder) {
        let mapping = Arc::new(Mapping::from_vec(bytes));
        let decoder = ZipDecoder::new(mapping.clone(), options).unwrap();
        (mapping, decoder)
    }

    #[test]
    fn test_walk_headers() {
        let zip = stored_zip(&[("dir/", b""), ("dir/b.png", b"png"), ("a.jpg", b"jpeg!")]);
        let (_mapping, mut decoder) = decoder_for(zip, DecoderOptions::default());
        assert_eq!(decoder.entries().len(), 3);

        let dir = decoder.next_header().unwrap().unwrap().clone();
        assert_eq!(dir.kind, EntryKind::Directory);
        let png = decoder.next_header().unwrap().unwrap().clone();
        assert_eq!(png.path.as_str(), "dir/b.png");
        assert_eq!(png.kind, EntryKind::File);
        assert_eq!(png.size, 3);
        assert!(!png.encrypted);
        let jpg = decoder.next_header().unwrap().unwrap().clone();
        assert_eq!(jpg.path.as_str(), "a.jpg");
        assert!(decoder.next_header().unwrap().is_none());
        assert!(decoder.next_header().unwrap().is_none());
    }

    #[test]
    fn test_stored_block_is_mapped() {
        let zip = stored_zip(&[("a.jpg", b"jpeg bytes")]);
        let (mapping, mut decoder) = decoder_for(zip, DecoderOptions::default());
        decoder.next_header().unwrap().unwrap();
        let block = decoder.read_data_block().unwrap().unwrap();
        assert_eq!(block.bytes, b"jpeg bytes");
        assert_eq!(block.offset, 0);
        assert!(mapping.contains(block.bytes.as_ptr()));
        assert!(decoder.read_data_block().unwrap().is_none());
    }

    #[test]
    fn test_read_data_skips_unread() {
        let zip = stored_zip(&[("a.jpg", b"first"), ("b.jpg", b"second")]);
        let (_mapping, mut decoder) = decoder_for(zip, DecoderOptions::default());
        decoder.next_header().unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(decoder.read_data(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"fi");

        decoder.next_header().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = decoder.read_data(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"second");
    }

    #[test]
    fn test_crc_mismatch() {
        let mut zip = stored_zip(&[("a.jpg", b"jpeg bytes")]);
        // Flip a data byte; it sits right after the 30-byte header and name.
        zip[30 + 5] ^= 0xff;
        let options = DecoderOptions {
            verify_crc: true,
            ..Default::default()
        };
        let (_mapping, mut decoder) = decoder_for(zip, options);
        decoder.next_header().unwrap();
        let mut buf = vec![0u8; 64];
        let mut result = Ok(1);
        while let Ok(n) = result {
            if n == 0 {
                break;
            }
            result = decoder.read_data(&mut buf);
        }
        assert!(matches!(result, Err(ArchiveError::Io(_))));
    }

    #[test]
    fn test_zip64_offset_out_of_range() {
        // Junk up front puts the Zip64 EOCDR past its nominal offset,
        // so the archive offset is nonzero.
        let mut zip = b"junkjunk".to_vec();

        zip.extend_from_slice(b"PK\x06\x06");
        zip.extend_from_slice(&44u64.to_le_bytes());
        zip.extend_from_slice(&[45, 0, 45, 0]);
        zip.extend_from_slice(&[0; 8]);
        zip.extend_from_slice(&[0; 16]);
        zip.extend_from_slice(&0u64.to_le_bytes());
        zip.extend_from_slice(&u64::MAX.to_le_bytes());

        zip.extend_from_slice(b"PK\x06\x07");
        zip.extend_from_slice(&0u32.to_le_bytes());
        zip.extend_from_slice(&0u64.to_le_bytes());
        zip.extend_from_slice(&1u32.to_le_bytes());

        zip.extend_from_slice(b"PK\x05\x06\0\0\0\0");
        zip.extend_from_slice(&[0xff; 4]);
        zip.extend_from_slice(&[0xff; 8]);
        zip.extend_from_slice(&[0, 0]);

        assert!(matches!(
            read_central_directory(&zip),
            Err(ArchiveError::InvalidArchive(_))
        ));
        let mapping = Arc::new(Mapping::from_vec(zip));
        assert!(matches!(
            ZipDecoder::new(mapping, DecoderOptions::default()),
            Err(ArchiveError::DecoderOpenFailed(_))
        ));
    }

    #[test]
    fn test_not_a_zip() {
        let mapping = Arc::new(Mapping::from_vec(b"PK\x03\x04 but nothing else".to_vec()));
        assert!(matches!(
            ZipDecoder::new(mapping, DecoderOptions::default()),
            Err(ArchiveError::DecoderOpenFailed(_))
        ));
    }
}
