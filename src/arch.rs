use crate::result::*;

/// A checked cast from u64 to usize
///
/// Entry sizes and archive offsets arrive as 64-bit values,
/// but every buffer and mapping range we hand out is indexed by usize.
pub fn usize<I: Into<u64>>(i: I) -> ArchiveResult<usize> {
    let i: u64 = i.into();
    usize::try_from(i).map_err(|_| ArchiveError::InsufficientAddressSpace)
}
