//! Random access to the playable entries of one open archive.
//!
//! An [`ArchiveSession`] owns everything: the mapping, the entry index,
//! and the decoder and buffer pools. Extraction takes `&self` and can be
//! called from as many threads as you like; opening, closing, and providing a
//! passphrase need the session to themselves, which the borrow checker enforces.
//!
//! ```no_run
//! # use seekarc::*;
//! # use rayon::prelude::*;
//! let session = ArchiveSession::open_path("comic.cbz", Options::default())?;
//! println!("{} pages", session.len());
//!
//! // Pages decode in parallel, each on its own cursor.
//! (0..session.len()).into_par_iter().try_for_each(|i| {
//!     let page = session.extract_to_memory(i)?;
//!     println!("{}: {} bytes", session.name(i).unwrap(), page.len());
//!     Ok::<_, ArchiveError>(())
//! })?;
//! # Ok::<(), ArchiveError>(())
//! ```

use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use log::*;

use crate::arch::usize;
use crate::buffers::{BufferPool, PooledBuffer};
use crate::decoder::{open_decoder, ArchiveFormat, DecoderOptions, EntryHeader};
use crate::index::{build_index, list_playable, Entry, EntryFilter, EntryIndex, DEFAULT_EXTENSIONS};
use crate::mapping::Mapping;
use crate::pool::{DecoderPool, ExhaustionPolicy};
use crate::result::*;

/// How much of an encrypted entry we decode to check a passphrase
const PASSWORD_CHECK_LEN: usize = 4096;

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Put entries in natural order by name instead of archive order.
    pub sort_entries: bool,

    /// How many decoder cursors to keep around.
    pub context_pool_capacity: usize,

    /// How many scratch buffers to keep around.
    /// Also roughly how many entries we expect to decode at once.
    pub buffer_pool_capacity: usize,

    pub exhaustion_policy: ExhaustionPolicy,

    /// Check CRC-32s of zip entries. Off by default, since plenty of
    /// archives in the wild have bad ones and the images decode just fine.
    pub verify_crc: bool,

    /// Extensions of playable files, without the leading dot (case-sensitive)
    pub extensions: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sort_entries: false,
            context_pool_capacity: 20,
            buffer_pool_capacity: 4,
            exhaustion_policy: ExhaustionPolicy::default(),
            verify_crc: false,
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// The bytes of an extracted entry, and where they live.
#[derive(Debug)]
pub enum EntryBuffer<'s> {
    /// A view of the entry, stored verbatim in the archive's mapping
    Mapped(&'s [u8]),
    /// A scratch buffer the entry was decoded into.
    /// It goes back to the session's buffer pool when dropped.
    Pooled(PooledBuffer<'s>),
}

impl EntryBuffer<'_> {
    pub fn is_mapped(&self) -> bool {
        matches!(self, EntryBuffer::Mapped(_))
    }
}

impl Deref for EntryBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            EntryBuffer::Mapped(view) => view,
            EntryBuffer::Pooled(buffer) => buffer,
        }
    }
}

/// An open archive
pub struct ArchiveSession {
    // Fields drop in order: pools, then the index, then the mapping.
    decoders: DecoderPool,
    buffers: BufferPool,
    index: EntryIndex,
    encrypted: bool,
    format: ArchiveFormat,
    mapping: Arc<Mapping>,
}

impl ArchiveSession {
    /// Maps the first `len` bytes of `file` and indexes them.
    pub fn open(file: &File, len: u64, options: Options) -> ArchiveResult<Self> {
        Self::with_mapping(Mapping::open(file, len)?, options)
    }

    /// Opens and indexes the archive at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P, options: Options) -> ArchiveResult<Self> {
        Self::with_mapping(Mapping::open_path(path)?, options)
    }

    /// Indexes an archive that's already in memory.
    pub fn from_bytes(bytes: Vec<u8>, options: Options) -> ArchiveResult<Self> {
        Self::with_mapping(Mapping::from_vec(bytes), options)
    }

    fn with_mapping(mapping: Mapping, options: Options) -> ArchiveResult<Self> {
        let mapping = Arc::new(mapping);
        let filter = EntryFilter::new(options.extensions.iter().cloned());
        let decoder_options = DecoderOptions {
            passphrase: None,
            verify_crc: options.verify_crc,
        };

        // Count first; some formats only know if they're encrypted
        // once every header has gone by.
        let summary = {
            let mut decoder = open_decoder(mapping.clone(), &decoder_options)?;
            list_playable(&mut *decoder, &filter)?
        };
        if summary.playable == 0 {
            return Err(ArchiveError::NoPlayableEntries);
        }
        mapping.advise(summary.format);

        let index = {
            let mut decoder = open_decoder(mapping.clone(), &decoder_options)?;
            build_index(
                &mut *decoder,
                &filter,
                &mapping,
                options.sort_entries,
                summary.playable,
            )?
        };
        let buffers = BufferPool::new(usize(index.max_entry_size)?, options.buffer_pool_capacity);
        let decoders = DecoderPool::new(
            mapping.clone(),
            decoder_options,
            filter,
            options.context_pool_capacity,
            options.exhaustion_policy,
        );
        info!(
            "Opened {:?} archive with {} playable entries{}",
            summary.format,
            index.entries.len(),
            if summary.encrypted { " (encrypted)" } else { "" }
        );

        Ok(Self {
            decoders,
            buffers,
            index,
            encrypted: summary.encrypted,
            format: summary.format,
            mapping,
        })
    }

    pub fn len(&self) -> usize {
        self.index.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.entries.is_empty()
    }

    /// The playable entries, in index order
    pub fn entries(&self) -> &[Entry] {
        &self.index.entries
    }

    pub fn entry(&self, index: usize) -> Option<&Entry> {
        self.index.entries.get(index)
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Size of the largest entry, and of every scratch buffer
    pub fn max_entry_size(&self) -> u64 {
        self.index.max_entry_size
    }

    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    pub fn decoder_pool(&self) -> &DecoderPool {
        &self.decoders
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffers
    }

    fn lookup(&self, index: usize) -> ArchiveResult<&Entry> {
        self.entry(index).ok_or(ArchiveError::NoSuchEntry(index))
    }

    /// The entry's name, as recorded when the archive was indexed
    pub fn name(&self, index: usize) -> Option<&str> {
        self.entry(index).map(|e| e.name.as_str())
    }

    /// Positions a decoder on the entry and returns its header.
    pub fn live_header(&self, index: usize) -> ArchiveResult<EntryHeader> {
        let entry = self.lookup(index)?;
        let context = self.decoders.acquire_for(entry.stream_index)?;
        context
            .current()
            .cloned()
            .ok_or(ArchiveError::NoSuchEntry(index))
    }

    /// Returns the entry's decoded bytes.
    ///
    /// Entries stored verbatim are served straight from the mapping.
    /// Everything else is decoded into one of the session's scratch buffers.
    pub fn extract_to_memory(&self, index: usize) -> ArchiveResult<EntryBuffer<'_>> {
        let entry = self.lookup(index)?;
        if let Some(range) = &entry.zero_copy {
            trace!("Serving {} from the mapping", entry.name);
            return Ok(EntryBuffer::Mapped(&self.mapping.as_slice()[range.clone()]));
        }

        let size = usize(entry.size)?;
        let mut context = self.decoders.acquire_for(entry.stream_index)?;
        let mut buffer = self.buffers.acquire();
        let read = context.read_fill(&mut buffer.spare()[..size]);
        match read {
            Ok(n) if n == size => {
                buffer.set_len(n);
                Ok(EntryBuffer::Pooled(buffer))
            }
            Ok(n) => {
                error!("{}: expected {size} bytes, decoded {n}", entry.name);
                context.discard();
                Err(ArchiveError::ShortRead {
                    expected: entry.size,
                    actual: n as u64,
                })
            }
            Err(e) => {
                error!("Couldn't decode {}: {e}", entry.name);
                context.discard();
                Err(e)
            }
        }
    }

    /// Gives back a buffer from [`extract_to_memory`](Self::extract_to_memory).
    ///
    /// Dropping it does the same; this just makes it explicit.
    pub fn release_buffer(&self, buffer: EntryBuffer<'_>) {
        match buffer {
            EntryBuffer::Mapped(_) => {}
            EntryBuffer::Pooled(buffer) => drop(buffer),
        }
    }

    /// Writes the entry's decoded bytes to `writer`, returning how many were written.
    pub fn extract_to_writer<W: Write + ?Sized>(
        &self,
        index: usize,
        writer: &mut W,
    ) -> ArchiveResult<u64> {
        let entry = self.lookup(index)?;
        if let Some(range) = &entry.zero_copy {
            writer.write_all(&self.mapping.as_slice()[range.clone()])?;
            return Ok(entry.size);
        }

        let mut context = self.decoders.acquire_for(entry.stream_index)?;
        let mut written = 0u64;
        let copied = loop {
            match context.read_data_block() {
                Ok(Some(block)) => {
                    if let Err(e) = writer.write_all(block.bytes) {
                        break Err(e.into());
                    }
                    written += block.bytes.len() as u64;
                }
                Ok(None) => break Ok(written),
                Err(e) => break Err(e),
            }
        };
        match copied {
            Ok(n) if n == entry.size => Ok(n),
            Ok(n) => {
                error!("{}: expected {} bytes, decoded {n}", entry.name, entry.size);
                context.discard();
                Err(ArchiveError::ShortRead {
                    expected: entry.size,
                    actual: n,
                })
            }
            Err(e) => {
                error!("Couldn't extract {}: {e}", entry.name);
                context.discard();
                Err(e)
            }
        }
    }

    /// Writes the entry's decoded bytes to `destination` at its current position.
    pub fn extract_to_file(&self, index: usize, destination: &File) -> ArchiveResult<u64> {
        let mut destination = destination;
        self.extract_to_writer(index, &mut destination)
    }

    /// True if any playable entry is encrypted
    pub fn needs_password(&self) -> bool {
        self.encrypted
    }

    /// Sets the passphrase for encrypted entries and checks it
    /// by decoding the start of the first one.
    ///
    /// If the check fails, the previous passphrase stays in effect.
    pub fn provide_password(&mut self, secret: &str) -> ArchiveResult<()> {
        let previous = self.decoders.options().passphrase.clone();
        self.decoders.set_passphrase(Some(secret.to_owned()));
        match self.check_password() {
            Ok(()) => {
                info!("Passphrase accepted");
                Ok(())
            }
            Err(e) => {
                warn!("Passphrase rejected: {e}");
                self.decoders.set_passphrase(previous);
                Err(e)
            }
        }
    }

    fn check_password(&self) -> ArchiveResult<()> {
        if !self.encrypted {
            return Ok(());
        }
        let mut decoder = open_decoder(self.mapping.clone(), self.decoders.options())?;
        let filter = self.decoders.filter();
        while let Some(header) = decoder.next_header()? {
            if header.encrypted && filter.is_playable(header) {
                debug!("Checking passphrase against {}", header.path);
                let mut sample = [0u8; PASSWORD_CHECK_LEN];
                decoder.read_data(&mut sample)?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Closes the archive, dropping every cursor and buffer
    /// before unmapping it.
    pub fn close(self) {
        drop(self)
    }
}

impl Drop for ArchiveSession {
    fn drop(&mut self) {
        debug!("Closing archive ({} entries)", self.len());
    }
}
