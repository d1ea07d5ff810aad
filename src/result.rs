//! Error types and the related `Result<T>`

use thiserror::Error;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An error from underlying I/O
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    /// The archive couldn't be memory mapped.
    #[error("Couldn't map archive: {0}")]
    MapFailed(#[source] std::io::Error),

    /// The decoder rejected the archive's data or format.
    #[error("Couldn't open archive: {0}")]
    DecoderOpenFailed(String),

    /// The archive contained invalid data per its format.
    #[error("Invalid archive: {0}")]
    InvalidArchive(&'static str),

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The archive uses an unsupported format or feature
    #[error("Unsupported archive: {0}")]
    UnsupportedArchive(String),

    /// The archive holds no regular files with a playable extension.
    #[error("No playable entries in archive")]
    NoPlayableEntries,

    /// A decoder couldn't be advanced to the requested stream index.
    /// The offending decoder is dropped; the session stays usable.
    #[error("Couldn't skip to stream index {index}: {reason}")]
    SkipFailed { index: usize, reason: String },

    /// Decoding produced fewer bytes than the entry's declared size.
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    /// Every decoder slot is checked out and the pool was told not to overflow.
    #[error("All decoder contexts are in use")]
    PoolExhausted,

    /// The entry is encrypted and no passphrase was provided.
    #[error("Passphrase required")]
    PasswordRequired,

    /// The provided passphrase doesn't decrypt the entry.
    #[error("Incorrect passphrase")]
    WrongPassword,

    /// There's no entry with the given index
    #[error("No entry with index {0}")]
    NoSuchEntry(usize),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Archive too large for address space")]
    InsufficientAddressSpace,
}
