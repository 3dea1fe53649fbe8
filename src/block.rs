//! Block references and the offset arithmetic between a block's parts.
//!
//! A block is addressed by the offset of its payload from the heap base.
//! Everything else (header, footer, neighbors) is computed from that offset
//! and the block sizes stored in the boundary tags.

use core::fmt;
use core::num::NonZeroU32;

use crate::header::HEADER_SIZE;

/// A reference to a block, i.e. the heap offset of its payload.
///
/// Offset 0 is always inside the free-list head array, so it never names a
/// payload and `Option<BlockRef>` is encoded as a plain `u32` with 0 for `None`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(NonZeroU32);

impl BlockRef {
    #[inline(always)]
    pub const fn new(offset: u32) -> Option<BlockRef> {
        match NonZeroU32::new(offset) {
            Some(offset) => Some(BlockRef(offset)),
            None => None,
        }
    }

    /// Decodes a free-list link word.
    #[inline(always)]
    pub const fn from_link(word: u32) -> Option<BlockRef> {
        BlockRef::new(word)
    }

    /// Encodes an optional block as a free-list link word.
    #[inline(always)]
    pub const fn to_link(block: Option<BlockRef>) -> u32 {
        match block {
            Some(block) => block.offset(),
            None => 0,
        }
    }

    /// Offset of the payload.
    #[inline(always)]
    pub const fn offset(self) -> u32 {
        self.0.get()
    }

    /// Offset of the header.
    #[inline(always)]
    pub const fn header(self) -> u32 {
        self.offset() - HEADER_SIZE
    }

    /// Offset of the footer of a block of `size` bytes.
    #[inline(always)]
    pub const fn footer(self, size: u32) -> u32 {
        self.offset() + size - 2 * HEADER_SIZE
    }

    /// Offset of the footer of the block immediately before this one.
    #[inline(always)]
    pub const fn prev_footer(self) -> u32 {
        self.offset() - 2 * HEADER_SIZE
    }

    /// The block right after this one, given this block's size.
    ///
    /// # Panics
    /// Panics if `size` would move the reference past the largest offset.
    #[inline(always)]
    pub fn next(self, size: u32) -> BlockRef {
        match self.0.checked_add(size) {
            Some(next) => BlockRef(next),
            None => panic!("block after {self:?} would lie past the largest heap offset"),
        }
    }

    /// The block right before this one, given the previous block's size.
    ///
    /// # Panics
    /// Panics if `prev_size` would move the reference to (or before) the heap base.
    #[inline(always)]
    pub fn prev(self, prev_size: u32) -> BlockRef {
        match self.offset().checked_sub(prev_size).and_then(BlockRef::new) {
            Some(prev) => prev,
            None => panic!("block before {self:?} would start at the heap base"),
        }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRef({:#x})", self.offset())
    }
}

/// What a block currently is, as read from its boundary tag.
///
/// The free-list links share storage with the payload, so they are only
/// meaningful in the `Free` variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockState {
    Free {
        prev: Option<BlockRef>,
        next: Option<BlockRef>,
    },
    Allocated,
}
