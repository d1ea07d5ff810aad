//! A flat surface over [`ArchiveSession`] for hosts that want sentinels, not `Result`s.
//!
//! Each call logs its error and returns `0`, `false`, or `None` instead.
//! At most one archive is open at a time; opening another closes the first.

use std::fs::File;

use log::*;

use crate::session::{ArchiveSession, EntryBuffer, Options};

#[derive(Default)]
pub struct ArchiveHost {
    session: Option<ArchiveSession>,
}

impl ArchiveHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the first `size` bytes of `file`, returning the number of
    /// playable entries, or 0 if the archive couldn't be opened.
    pub fn open(&mut self, file: &File, size: u64, sort_entries: bool) -> usize {
        self.close();
        let options = Options {
            sort_entries,
            ..Default::default()
        };
        match ArchiveSession::open(file, size, options) {
            Ok(session) => {
                let count = session.len();
                self.session = Some(session);
                count
            }
            Err(e) => {
                error!("Couldn't open archive: {e}");
                0
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// The open session, if any
    pub fn session(&self) -> Option<&ArchiveSession> {
        self.session.as_ref()
    }

    pub fn need_password(&self) -> bool {
        self.session.as_ref().map_or(false, ArchiveSession::needs_password)
    }

    /// Returns false if the passphrase doesn't decrypt the archive.
    pub fn provide_password(&mut self, secret: &str) -> bool {
        let Some(session) = self.session.as_mut() else {
            error!("No archive is open");
            return false;
        };
        match session.provide_password(secret) {
            Ok(()) => true,
            Err(e) => {
                error!("Couldn't use passphrase: {e}");
                false
            }
        }
    }

    pub fn filename(&self, index: usize) -> Option<String> {
        let name = self.session.as_ref()?.name(index);
        if name.is_none() {
            error!("No entry {index}");
        }
        name.map(str::to_owned)
    }

    /// Every buffer this returns should go back through
    /// [`release_buffer`](Self::release_buffer).
    pub fn extract_to_buffer(&self, index: usize) -> Option<EntryBuffer<'_>> {
        let session = self.session.as_ref()?;
        session
            .extract_to_memory(index)
            .map_err(|e| error!("Couldn't extract entry {index}: {e}"))
            .ok()
    }

    pub fn extract_to_file(&self, index: usize, destination: &File) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        match session.extract_to_file(index, destination) {
            Ok(_) => true,
            Err(e) => {
                error!("Couldn't extract entry {index} to file: {e}");
                false
            }
        }
    }

    pub fn release_buffer(&self, buffer: EntryBuffer<'_>) {
        match &self.session {
            Some(session) => session.release_buffer(buffer),
            None => drop(buffer),
        }
    }

    /// Closes the open archive. Does nothing if there isn't one.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}
