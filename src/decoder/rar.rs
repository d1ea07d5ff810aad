//! A forward-only cursor over a RAR archive.
//!
//! RAR 5 is the format of interest, but anything the backend can parse
//! (back to RAR 1.5) is walked the same way. Headers are all read when the
//! archive is opened; an entry's data is decoded into one buffer the first
//! time something reads it. Multi-volume sets aren't supported, so entries
//! split across volumes are listed but never playable.

use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use log::*;
use rars::{ArchiveMember, ArchiveReadOptions, ArchiveReader, ErrorKind};

use super::*;
use crate::mapping::{MappedReader, Mapping};

/// The entry the cursor is positioned on
struct Current {
    header: EntryHeader,
    /// Index into the archive's member list
    index: usize,
    data: Option<Vec<u8>>,
    consumed: usize,
}

/// Walks a RAR archive's members in order.
pub struct RarDecoder {
    archive: rars::Archive,
    headers: Vec<EntryHeader>,
    next: usize,
    current: Option<Current>,
    passphrase: Option<Vec<u8>>,
}

impl RarDecoder {
    pub fn new(source: Arc<Mapping>, options: &DecoderOptions) -> ArchiveResult<Self> {
        let passphrase = options.passphrase.as_ref().map(|p| p.as_bytes().to_vec());
        let read_options = ArchiveReadOptions::with_optional_password(passphrase.as_deref());
        let archive = ArchiveReader::read_reader_with_options(MappedReader::new(source), read_options)
            .map_err(|e| match e.kind() {
                ErrorKind::PasswordRequired => ArchiveError::PasswordRequired,
                ErrorKind::BadPassword => ArchiveError::WrongPassword,
                ErrorKind::UnsupportedFormat | ErrorKind::UnsupportedFeature => {
                    ArchiveError::UnsupportedArchive(e.to_string())
                }
                _ => ArchiveError::DecoderOpenFailed(e.to_string()),
            })?;
        let headers: Vec<EntryHeader> = archive.members().map(|m| entry_header(&m)).collect();
        debug!(
            "{:?} archive with {} members",
            archive.family(),
            headers.len()
        );
        Ok(Self {
            archive,
            headers,
            next: 0,
            current: None,
            passphrase,
        })
    }

    /// Decodes the current entry if nobody has yet.
    fn load(&mut self) -> ArchiveResult<()> {
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };
        if current.data.is_some() {
            return Ok(());
        }
        let data = if current.header.kind == EntryKind::File {
            trace!("Decoding {}", current.header.path);
            self.archive
                .read_member_at(current.index, self.passphrase.as_deref())
                .map_err(|e| {
                    data_error(&e, current.header.encrypted, self.passphrase.is_some())
                })?
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        current.data = Some(data);
        Ok(())
    }
}

fn entry_header(member: &ArchiveMember) -> EntryHeader {
    let meta = &member.meta;
    let kind = if meta.is_directory {
        EntryKind::Directory
    } else if meta.is_redirection || meta.is_split_before || meta.is_split_after {
        EntryKind::Other
    } else {
        EntryKind::File
    };
    EntryHeader {
        path: Utf8PathBuf::from(meta.name_lossy()),
        kind,
        size: meta.unpacked_size,
        encrypted: meta.is_encrypted,
        last_modified: meta
            .modification_time()
            .map(|time| DateTime::<Utc>::from(time).naive_utc()),
    }
}

/// Maps a failure to decode a member.
///
/// RAR 5 stores a passphrase check value, but older versions don't,
/// so a bad passphrase often shows up as a checksum mismatch instead.
fn data_error(e: &rars::Error, encrypted: bool, passphrase: bool) -> ArchiveError {
    match e.kind() {
        ErrorKind::PasswordRequired => ArchiveError::PasswordRequired,
        ErrorKind::BadPassword => ArchiveError::WrongPassword,
        _ if encrypted && !passphrase => ArchiveError::PasswordRequired,
        _ if encrypted => ArchiveError::WrongPassword,
        ErrorKind::UnsupportedFormat | ErrorKind::UnsupportedFeature => {
            ArchiveError::UnsupportedArchive(e.to_string())
        }
        _ => ArchiveError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

impl SequentialDecoder for RarDecoder {
    fn next_header(&mut self) -> ArchiveResult<Option<&EntryHeader>> {
        self.current = None;
        let Some(header) = self.headers.get(self.next) else {
            return Ok(None);
        };
        trace!("{:?}", header);
        self.current = Some(Current {
            header: header.clone(),
            index: self.next,
            data: None,
            consumed: 0,
        });
        self.next += 1;
        Ok(self.current.as_ref().map(|c| &c.header))
    }

    fn read_data_block(&mut self) -> ArchiveResult<Option<DataBlock<'_>>> {
        self.load()?;
        let Some(current) = self.current.as_mut() else {
            return Ok(None);
        };
        let data = current.data.as_deref().unwrap_or_default();
        let start = current.consumed;
        let end = data.len().min(start + BLOCK_SIZE);
        if start == end {
            return Ok(None);
        }
        current.consumed = end;
        Ok(Some(DataBlock {
            bytes: &data[start..end],
            offset: start as u64,
        }))
    }

    fn read_data(&mut self, buf: &mut [u8]) -> ArchiveResult<usize> {
        self.load()?;
        let Some(current) = self.current.as_mut() else {
            return Ok(0);
        };
        let data = current.data.as_deref().unwrap_or_default();
        let remaining = &data[current.consumed..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        current.consumed += n;
        Ok(n)
    }

    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Rar
    }
}
