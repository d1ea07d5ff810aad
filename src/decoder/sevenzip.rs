//! A forward-only cursor over a 7z archive.
//!
//! The header at the back of a 7z file lists every entry up front,
//! so walking headers costs nothing. An entry's data is only decoded
//! (into one buffer, all at once) when something asks to read it;
//! entries that are skipped over are never touched.

use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use log::*;

use super::*;
use crate::mapping::{MappedReader, Mapping};

/// The entry the cursor is positioned on
struct Current {
    header: EntryHeader,
    /// Index into the archive's entry list
    index: usize,
    /// The whole entry, once something has asked for it
    data: Option<Vec<u8>>,
    consumed: usize,
}

/// Walks a 7z archive's entries in order.
pub struct SevenZipDecoder {
    archive: zesven::Archive<MappedReader>,
    next: usize,
    current: Option<Current>,
    passphrase: bool,
}

impl SevenZipDecoder {
    pub fn new(source: Arc<Mapping>, options: &DecoderOptions) -> ArchiveResult<Self> {
        let reader = MappedReader::new(source);
        let archive = match &options.passphrase {
            Some(secret) => zesven::Archive::open_with_password(reader, secret.as_str()),
            None => zesven::Archive::open(reader),
        }
        .map_err(open_error)?;
        debug!("7z archive with {} entries", archive.entries().len());
        Ok(Self {
            archive,
            next: 0,
            current: None,
            passphrase: options.passphrase.is_some(),
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
                .extract_entry_to_vec_by_index(current.index)
                .map_err(|e| data_error(e, current.header.encrypted, self.passphrase))?
        } else {
            Vec::new()
        };
        current.data = Some(data);
        Ok(())
    }
}

fn entry_header(entry: &zesven::Entry) -> EntryHeader {
    let kind = if entry.is_directory {
        EntryKind::Directory
    } else if entry.is_symlink {
        EntryKind::Symlink
    } else if entry.is_anti {
        // Deletion markers from update archives
        EntryKind::Other
    } else {
        EntryKind::File
    };
    EntryHeader {
        path: Utf8PathBuf::from(entry.path.as_str()),
        kind,
        size: entry.size,
        encrypted: entry.is_encrypted,
        last_modified: entry
            .modified()
            .map(|time| DateTime::<Utc>::from(time).naive_utc()),
    }
}

/// Maps a failure to read the archive's header.
fn open_error(e: zesven::Error) -> ArchiveError {
    match e {
        zesven::Error::PasswordRequired => ArchiveError::PasswordRequired,
        zesven::Error::WrongPassword { .. } => ArchiveError::WrongPassword,
        e if e.is_unsupported() => ArchiveError::UnsupportedArchive(e.to_string()),
        e => ArchiveError::DecoderOpenFailed(e.to_string()),
    }
}

/// Maps a failure to decode an entry.
///
/// AES with the wrong key doesn't always fail its quick check;
/// sometimes it just produces garbage the codec or CRC then chokes on.
/// For an encrypted entry, we blame the passphrase.
fn data_error(e: zesven::Error, encrypted: bool, passphrase: bool) -> ArchiveError {
    match e {
        zesven::Error::PasswordRequired => ArchiveError::PasswordRequired,
        zesven::Error::WrongPassword { .. } => ArchiveError::WrongPassword,
        zesven::Error::Io(e) => ArchiveError::Io(e),
        _ if encrypted && !passphrase => ArchiveError::PasswordRequired,
        _ if encrypted => ArchiveError::WrongPassword,
        e if e.is_unsupported() => ArchiveError::UnsupportedArchive(e.to_string()),
        e => ArchiveError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

impl SequentialDecoder for SevenZipDecoder {
    fn next_header(&mut self) -> ArchiveResult<Option<&EntryHeader>> {
        self.current = None;
        let Some(entry) = self.archive.entries().get(self.next) else {
            return Ok(None);
        };
        let header = entry_header(entry);
        trace!("{:?}", header);
        self.current = Some(Current {
            header,
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
        ArchiveFormat::SevenZip
    }
}
