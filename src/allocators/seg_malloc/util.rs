//! Utility functions specific to the [`SegMalloc`](super::SegMalloc) allocator.

use super::{DWORD_SIZE, MIN_BLOCK_SIZE};
use crate::util::find_divisible;

/// Returns the block size needed to serve a request of `size` payload bytes:
/// the payload plus header and footer, rounded up to [`DWORD_SIZE`] and
/// never below [`MIN_BLOCK_SIZE`].
/// Returns `None` if that size does not fit a boundary tag.
#[inline]
pub fn adjust_size(size: usize) -> Option<u32> {
    if size <= DWORD_SIZE as usize {
        return Some(MIN_BLOCK_SIZE);
    }
    let overhead = DWORD_SIZE as usize;
    let block_size = find_divisible(size.checked_add(overhead)?, DWORD_SIZE as usize)?;
    u32::try_from(block_size).ok()
}
