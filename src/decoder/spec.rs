//! Code specific to the ZIP file format specification.
//!
//! We try to keep the nitty gritty here,
//! and the cursor logic in the [`zip`](super::zip) module.
//!
//! Most comments quote the ZIP spec, [`APPNOTE.TXT`].
//!
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;
use std::convert::TryInto;

use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveDateTime};
use codepage_437::*;
use memchr::memmem;

use super::zip::{CompressionMethod, ZipEntry};
use crate::arch::usize;
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];

impl CompressionMethod {
    fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::None,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }
}

/// The OS a file in the archive was compressed with.
/// Used to decode additional metadata like file types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum System {
    Dos,
    Unix,
    Unknown,
}

impl System {
    fn from_source_version(source_version: u16) -> Self {
        // 4.4.2.1 The upper byte indicates the compatibility of the file
        // attribute information. [...]
        //  0 - MS-DOS and OS/2 (FAT / VFAT / FAT32 file systems)
        //  3 - UNIX
        match source_version >> 8 {
            0 => System::Dos,
            3 => System::Unix,
            _ => System::Unknown,
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Splits `len` bytes off the front of `input`, or complains about truncation.
fn take<'a>(input: &mut &'a [u8], len: usize, what: &'static str) -> ZipSlice<'a> {
    if input.len() < len {
        return Err(ArchiveError::InvalidArchive(what));
    }
    let (taken, rest) = input.split_at(len);
    *input = rest;
    Ok(taken)
}

type ZipSlice<'a> = ArchiveResult<&'a [u8]>;

fn take_u64(input: &mut &[u8]) -> ArchiveResult<u64> {
    let mut bytes = take(input, 8, "Truncated Zip64 extra field")?;
    Ok(read_u64(&mut bytes))
}

/// Data from the End of central directory record
#[derive(Debug)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
}

impl EndOfCentralDirectory {
    pub fn parse(mut eocdr: &[u8]) -> ArchiveResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        let mut fixed = take(
            &mut eocdr,
            22,
            "Truncated End Of Central Directory Record",
        )?;
        // The search found the magic; skip it.
        fixed = &fixed[4..];
        Ok(Self {
            disk_number: read_u16(&mut fixed),
            disk_with_central_directory: read_u16(&mut fixed),
            entries_on_this_disk: read_u16(&mut fixed),
            entries: read_u16(&mut fixed),
            central_directory_size: read_u32(&mut fixed),
            central_directory_offset: read_u32(&mut fixed),
        })
    }
}

/// Searches backward through `mapping` to find the
/// End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable size means we can't jump to a known offset.
pub fn find_eocdr(mapping: &[u8]) -> ArchiveResult<usize> {
    memmem::rfind(mapping, &EOCDR_MAGIC).ok_or(ArchiveError::InvalidArchive(
        "Couldn't find End Of Central Directory Record",
    ))
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn parse(mut mapping: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        if mapping.len() < Self::size_in_file() || mapping[..4] != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        mapping = &mapping[4..];
        let disk_with_central_directory = read_u32(&mut mapping);
        let zip64_eocdr_offset = read_u64(&mut mapping);
        let disks = read_u32(&mut mapping);

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    pub fn size_in_file() -> usize {
        20
    }
}

/// Data from the Zip64 end of central directory record
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory {
    pub entries: u64,
    pub central_directory_offset: u64,
}

impl Zip64EndOfCentralDirectory {
    pub fn parse(mut eocdr: &[u8]) -> ArchiveResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        let mut fixed = take(
            &mut eocdr,
            56,
            "Truncated Zip64 End Of Central Directory Record",
        )?;
        fixed = &fixed[4..];
        let _eocdr_size = read_u64(&mut fixed);
        let _source_version = read_u16(&mut fixed);
        let _minimum_extract_version = read_u16(&mut fixed);
        let _disk_number = read_u32(&mut fixed);
        let _disk_with_central_directory = read_u32(&mut fixed);
        let _entries_on_this_disk = read_u64(&mut fixed);
        let entries = read_u64(&mut fixed);
        let _central_directory_size = read_u64(&mut fixed);
        let central_directory_offset = read_u64(&mut fixed);

        Ok(Self {
            entries,
            central_directory_offset,
        })
    }
}

/// Finds the Zip64 end of central directory record in the given slice.
///
/// The slice should start at the Zip64 EOCDR's nominal location,
/// but we might have to do some searching since ZIP archives can have
/// arbitrary junk up front.
pub fn find_zip64_eocdr(mapping: &[u8]) -> ArchiveResult<usize> {
    memmem::find(mapping, &ZIP64_EOCDR_MAGIC).ok_or(ArchiveError::InvalidArchive(
        "Couldn't find zip64 End Of Central Directory Record",
    ))
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        let mut fixed = take(entry, 46, "Truncated central directory entry")?;
        if fixed[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(ArchiveError::InvalidArchive("Invalid central directory entry"));
        }
        fixed = &fixed[4..];
        let source_version = read_u16(&mut fixed);
        let _minimum_extract_version = read_u16(&mut fixed);
        let flags = read_u16(&mut fixed);
        let compression_method = read_u16(&mut fixed);
        let last_modified_time = read_u16(&mut fixed);
        let last_modified_date = read_u16(&mut fixed);
        let crc32 = read_u32(&mut fixed);
        let compressed_size = read_u32(&mut fixed);
        let uncompressed_size = read_u32(&mut fixed);
        let path_length = usize(read_u16(&mut fixed))?;
        let extra_field_length = usize(read_u16(&mut fixed))?;
        let file_comment_length = usize(read_u16(&mut fixed))?;
        let disk_number = read_u16(&mut fixed);
        let _internal_file_attributes = read_u16(&mut fixed);
        let external_file_attributes = read_u32(&mut fixed);
        let header_offset = read_u32(&mut fixed);
        let path = take(entry, path_length, "Truncated central directory path")?;
        let extra_field = take(entry, extra_field_length, "Truncated extra field")?;
        let _file_comment = take(entry, file_comment_length, "Truncated file comment")?;

        Ok(Self {
            source_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
        })
    }
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub flags: u16,
    pub compression_method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    pub fn parse_and_consume(header: &mut &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        let mut fixed = take(header, 30, "Truncated local file header")?;
        if fixed[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(ArchiveError::InvalidArchive("Invalid local file header"));
        }
        fixed = &fixed[4..];
        let _minimum_extract_version = read_u16(&mut fixed);
        let flags = read_u16(&mut fixed);
        let compression_method = read_u16(&mut fixed);
        let _last_modified_time = read_u16(&mut fixed);
        let _last_modified_date = read_u16(&mut fixed);
        let crc32 = read_u32(&mut fixed);
        let compressed_size = read_u32(&mut fixed);
        let uncompressed_size = read_u32(&mut fixed);
        let path_length = usize(read_u16(&mut fixed))?;
        let extra_field_length = usize(read_u16(&mut fixed))?;
        let path = take(header, path_length, "Truncated local file path")?;
        let _extra_field = take(header, extra_field_length, "Truncated extra field")?;

        Ok(Self {
            flags,
            compression_method,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
        })
    }

    /// True if sizes and CRC were written after the data instead of here.
    pub fn has_data_descriptor(&self) -> bool {
        has_data_descriptor(self.flags)
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumed to be CP437.
fn is_utf8(flags: u16) -> bool {
    // Bit 11: Language encoding flag (EFS).  If this bit is set,
    //         the filename and comment fields for this file
    //         MUST be encoded using UTF-8. (see APPENDIX D)
    flags & (1 << 11) != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    // Bit 0: If set, indicates that the file is encrypted
    flags & 1 != 0
}

fn has_data_descriptor(flags: u16) -> bool {
    // Bit 3: If this bit is set, the fields crc-32, compressed
    //        size and uncompressed size are set to zero in the
    //        local header. The correct values are put in the
    //        data descriptor immediately following the compressed data.
    flags & (1 << 3) != 0
}

/// Decodes an entry path per the UTF-8 flag, falling back to CP437.
pub fn decode_path(raw: &[u8], flags: u16) -> ArchiveResult<Utf8PathBuf> {
    if is_utf8(flags) {
        let utf8 = std::str::from_utf8(raw).map_err(ArchiveError::Encoding)?;
        Ok(Utf8PathBuf::from(utf8))
    } else {
        let str_cow: Cow<str> = Cow::borrow_from_cp437(raw, &CP437_CONTROL);
        Ok(Utf8PathBuf::from(str_cow.into_owned()))
    }
}

impl ZipEntry {
    /// Extracts a `ZipEntry` from a central directory entry
    pub(crate) fn from_cde(cde: &CentralDirectoryEntry) -> ArchiveResult<Self> {
        let path = decode_path(cde.path, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                path, cde.disk_number,
            )));
        }

        let unix_mode = match System::from_source_version(cde.source_version) {
            System::Unix => Some((cde.external_file_attributes >> 16) as u16),
            System::Dos | System::Unknown => None,
        };

        let mut entry = Self {
            size: u64::from(cde.uncompressed_size),
            compressed_size: u64::from(cde.compressed_size),
            compression_method: CompressionMethod::from_u16(cde.compression_method),
            crc32: cde.crc32,
            flags: cde.flags,
            encrypted: is_encrypted(cde.flags),
            path,
            last_modified_time: cde.last_modified_time,
            last_modified: parse_msdos(cde.last_modified_time, cde.last_modified_date),
            unix_mode,
            header_offset: u64::from(cde.header_offset),
        };

        parse_extra_field(&mut entry, cde.extra_field)?;

        Ok(entry)
    }

    pub(crate) fn has_data_descriptor(&self) -> bool {
        has_data_descriptor(self.flags)
    }
}

fn parse_msdos(time: u16, date: u16) -> Option<NaiveDateTime> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)?.and_hms_opt(hours, minutes, seconds)
}

/// Parses the "extra fields" found in central directory entries.
///
/// Currently we just look for Zip64 info (64-bit values for files > 2^32 in size)
fn parse_extra_field(entry: &mut ZipEntry, mut extra_field: &[u8]) -> ArchiveResult<()> {
    // 4.5.1 In order to allow different programs and different types
    // of information to be stored in the 'extra' field in .ZIP
    // files, the following structure MUST be used for all
    // programs storing data in this field:
    //
    //     header1+data1 + header2+data2 . . .
    //
    // Each header MUST consist of:
    //
    //     Header ID - 2 bytes
    //     Data Size - 2 bytes
    while extra_field.len() >= 4 {
        let kind = read_u16(&mut extra_field);
        let field_len = usize(read_u16(&mut extra_field))?;
        let mut field = take(&mut extra_field, field_len, "Truncated extra field")?;

        // Zip64 extended information extra field
        if kind == 0x0001 {
            if entry.size == u64::from(u32::MAX) {
                entry.size = take_u64(&mut field)?;
            }
            if entry.compressed_size == u64::from(u32::MAX) {
                entry.compressed_size = take_u64(&mut field)?;
            }
            if entry.header_offset == u64::from(u32::MAX) {
                entry.header_offset = take_u64(&mut field)?;
            }
        }
    }
    Ok(())
}
