//! seekarc serves the images in an archive by index, in any order,
//! from any number of threads, even when the archive can only be read
//! front to back:
//!
//! ```no_run
//! # use seekarc::*;
//! let session = ArchiveSession::open_path("comic.cbz", Options {
//!     sort_entries: true,
//!     ..Default::default()
//! })?;
//!
//! for (i, entry) in session.entries().iter().enumerate() {
//!     println!("{}: {} ({} bytes)", i, entry.name, entry.size);
//! }
//!
//! // Entries can be read out in whatever order the reader turns pages.
//! let page = session.extract_to_memory(7)?;
//! // Stored (uncompressed) entries come straight from the memory-mapped archive,
//! // everything else is decoded into a recycled scratch buffer.
//! println!("{} bytes, mapped: {}", page.len(), page.is_mapped());
//! # Ok::<(), ArchiveError>(())
//! ```
//!
//! Tarballs (and compressed tarballs especially) have no table of contents:
//! getting to the tenth file means reading past the first nine.
//! Rather than start from the top for every request, each session keeps a pool
//! of decoder cursors parked wherever their last request left them, and
//! hands each request the one closest behind it.
//!
//! Zip, 7z, and RAR archives are random access at heart, but they're read
//! through the same machinery so that every format behaves the same way.
//!
//! Archives are memory-mapped.
//! (On 64-bit systems, this allows us to treat archives as a contiguous byte range
//! even if the file is _much_ larger than physical RAM. 32-bit systems are limited
//! by address space to archives under 4 GB, but seekarc _should_ be well-behaved
//! if the archive is small enough.)

pub mod buffers;
pub mod decoder;
pub mod host;
pub mod index;
pub mod mapping;
pub mod natord;
pub mod pool;
pub mod result;
pub mod session;

pub use decoder::{ArchiveFormat, EntryHeader, EntryKind};
pub use host::ArchiveHost;
pub use index::{Entry, EntryFilter};
pub use pool::ExhaustionPolicy;
pub use result::{ArchiveError, ArchiveResult};
pub use session::{ArchiveSession, EntryBuffer, Options};

mod arch;
