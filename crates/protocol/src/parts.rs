//! Multipart arithmetic shared by the upload coordinator and the broker.
//!
//! Parts are numbered from 1. Part `n` covers
//! `[(n - 1) * chunk_size, n * chunk_size)`, except the last part which
//! ends at the file size. A file whose size is an exact multiple of the
//! chunk size therefore ends with a full part, never an empty one.

use std::ops::Range;

/// Number of parts needed to upload `file_size` bytes, at least 1.
pub fn number_of_multiparts(file_size: u64, chunk_size: u64) -> u32 {
    if chunk_size == 0 {
        return 1;
    }
    let parts = file_size.div_ceil(chunk_size).max(1);
    u32::try_from(parts).unwrap_or(u32::MAX)
}

/// Byte range covered by `part` (1-based).
///
/// Returns `None` if `part` is 0 or lies beyond the last part.
pub fn part_range(part: u32, file_size: u64, chunk_size: u64) -> Option<Range<u64>> {
    let count = number_of_multiparts(file_size, chunk_size);
    if part == 0 || part > count {
        return None;
    }
    let start = u64::from(part - 1) * chunk_size;
    let end = if part == count {
        file_size
    } else {
        start + chunk_size
    };
    Some(start..end)
}

/// Size of the final part: `file_size - (part_count - 1) * chunk_size`.
pub fn last_part_len(file_size: u64, chunk_size: u64) -> u64 {
    let count = number_of_multiparts(file_size, chunk_size);
    file_size - u64::from(count - 1) * chunk_size
}
