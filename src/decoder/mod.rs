//! Forward-only archive decoders.
//!
//! Every supported format is read through [`SequentialDecoder`]:
//! a cursor that walks headers in the archive's natural order,
//! can read the current entry's data, and never rewinds.
//! Random access is built on top of this by the [`pool`](crate::pool).

use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::NaiveDateTime;
use flate2::read::MultiGzDecoder;
use log::*;
use liblzma::read::XzDecoder;

use crate::mapping::{MappedReader, Mapping};
use crate::result::*;

mod crc_reader;
mod rar;
mod sevenzip;
mod spec;
mod tar;
mod zip;
pub mod zipcrypto;

pub use self::rar::RarDecoder;
pub use self::sevenzip::SevenZipDecoder;
pub use self::tar::TarDecoder;
pub use self::zip::{CompressionMethod, ZipDecoder, ZipEntry};

#[cfg(test)]
pub(crate) use self::tar::fixtures as tar_fixtures;

/// The container formats we can walk
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    /// A tarball wrapped in gzip
    TarGzip,
    /// A tarball wrapped in xz
    TarXz,
    SevenZip,
    /// RAR 5, or an older RAR version
    Rar,
}

/// What kind of filesystem object an entry describes
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Hard links, devices, FIFOs, ...
    Other,
}

/// Metadata for the entry a decoder is currently positioned on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// The provided path of the entry
    pub path: Utf8PathBuf,

    pub kind: EntryKind,

    /// Uncompressed size in bytes
    pub size: u64,

    /// True if reading the entry's data needs a passphrase
    pub encrypted: bool,

    /// When the entry was last modified, if the archive says
    pub last_modified: Option<NaiveDateTime>,
}

/// A run of the current entry's decoded bytes.
///
/// `bytes` either points into the decoder's own scratch space
/// or, for data stored verbatim, straight into the source [`Mapping`].
#[derive(Debug)]
pub struct DataBlock<'a> {
    pub bytes: &'a [u8],
    /// Where `bytes` starts within the entry
    pub offset: u64,
}

/// Options every new decoder is opened with
#[derive(Debug, Clone, Default)]
pub struct DecoderOptions {
    /// Passphrase for encrypted entries
    pub passphrase: Option<String>,
    /// Check each entry's CRC-32 as it is read, where the format has one.
    pub verify_crc: bool,
}

/// A forward-only cursor into an archive.
pub trait SequentialDecoder: Send {
    /// Advances to the next entry, skipping whatever is left of the current one.
    /// Returns `None` at the end of the archive.
    fn next_header(&mut self) -> ArchiveResult<Option<&EntryHeader>>;

    /// Reads the next block of the current entry's data,
    /// or `None` once it has all been read.
    fn read_data_block(&mut self) -> ArchiveResult<Option<DataBlock<'_>>>;

    /// Reads the current entry's data into `buf`, returning the number
    /// of bytes read. Zero means the entry has been fully read.
    fn read_data(&mut self, buf: &mut [u8]) -> ArchiveResult<usize>;

    fn format(&self) -> ArchiveFormat;
}

/// Size of the blocks decoders hand out when they can't point into the mapping.
pub(crate) const BLOCK_SIZE: usize = 64 * 1024;

/// What the first bytes of an archive look like
#[derive(Debug, PartialEq, Eq)]
enum Signature {
    Zip,
    Gzip,
    Xz,
    Tar,
    SevenZip,
    Rar,
    Unknown,
}

fn sniff(bytes: &[u8]) -> Signature {
    const SEVEN_ZIP: &[u8] = &[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c];
    const RAR: &[u8] = b"Rar!\x1a\x07";
    const XZ: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0];

    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
        Signature::Zip
    } else if bytes.starts_with(&[0x1f, 0x8b]) {
        Signature::Gzip
    } else if bytes.starts_with(XZ) {
        Signature::Xz
    } else if bytes.starts_with(SEVEN_ZIP) {
        Signature::SevenZip
    } else if bytes.starts_with(RAR) {
        Signature::Rar
    } else if tar::looks_like_tar(bytes) {
        Signature::Tar
    } else {
        Signature::Unknown
    }
}

/// Opens a decoder on `source`, picking the format from its signature.
pub fn open_decoder(
    source: Arc<Mapping>,
    options: &DecoderOptions,
) -> ArchiveResult<Box<dyn SequentialDecoder>> {
    let signature = sniff(source.as_slice());
    trace!("Archive signature: {signature:?}");
    let decoder: Box<dyn SequentialDecoder> = match signature {
        Signature::Zip => Box::new(ZipDecoder::new(source, options.clone())?),
        Signature::Tar => Box::new(TarDecoder::mapped(source)),
        Signature::Gzip => Box::new(TarDecoder::filtered(
            Box::new(MultiGzDecoder::new(MappedReader::new(source))),
            ArchiveFormat::TarGzip,
        )),
        Signature::Xz => Box::new(TarDecoder::filtered(
            Box::new(XzDecoder::new(MappedReader::new(source))),
            ArchiveFormat::TarXz,
        )),
        Signature::SevenZip => Box::new(SevenZipDecoder::new(source, options)?),
        Signature::Rar => Box::new(RarDecoder::new(source, options)?),
        Signature::Unknown => {
            return Err(ArchiveError::DecoderOpenFailed(String::from(
                "Unrecognized archive format",
            )))
        }
    };
    Ok(decoder)
}

/// Where the last `.` of `name` starts its extension,
/// so `a.tar.jpg` has the extension `jpg` and `.jpg` does too.
pub fn extension(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, ext)| ext)
}
