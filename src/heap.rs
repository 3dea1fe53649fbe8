//! Defines the [`Heap`] arena, the only place where heap memory is touched.
//!
//! The heap is a contiguous region obtained from a [`Grower`]. Everything in it
//! is addressed by `u32` offsets from its base, and every access goes through
//! the bounds-checked word accessors below, so a corrupted size or link can at
//! worst make the allocator panic, never read or write outside the region.

use core::fmt;
use core::ptr::{copy_nonoverlapping, NonNull};

use tracing::{debug, error};

use crate::block::{BlockRef, BlockState};
use crate::growers::{GrowError, Grower, GROWER_ALIGN};
use crate::header::{Header, HEADER_SIZE};

/// Why the heap could not be attached to its grower's memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AttachError {
    Grow(GrowError),
    Misaligned,
}

impl From<GrowError> for AttachError {
    fn from(e: GrowError) -> Self {
        AttachError::Grow(e)
    }
}

pub(crate) struct Heap<G: Grower> {
    grower: G,
    base: Option<NonNull<u8>>,
    len: u32,
}

impl<G: Grower> Heap<G> {
    pub const fn new(grower: G) -> Self {
        Heap {
            grower,
            base: None,
            len: 0,
        }
    }

    /// Current size of the heap in bytes.
    #[inline(always)]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline(always)]
    pub fn is_attached(&self) -> bool {
        self.base.is_some()
    }

    /// Obtains the first `size` bytes of the heap from the grower.
    pub fn attach(&mut self, size: u32) -> Result<(), AttachError> {
        debug_assert!(self.base.is_none(), "heap attached twice.");
        let base = self.grower.grow(size as usize)?;
        if base.as_ptr() as usize % GROWER_ALIGN != 0 {
            error!(?base, "Grower handed out a misaligned heap base.");
            return Err(AttachError::Misaligned);
        }
        self.base = Some(base);
        self.len = size;
        debug!(?base, size, "Heap attached.");
        Ok(())
    }

    /// Grows the heap by `size` bytes.
    /// Returns the offset at which the new region starts, i.e. the old heap size.
    pub fn grow(&mut self, size: u32) -> Result<u32, GrowError> {
        let base = self.base()?;
        let Some(new_len) = self.len.checked_add(size) else {
            error!(len = self.len, size, "Heap would outgrow 32-bit offsets.");
            return Err(GrowError);
        };
        let start = self.grower.grow(size as usize)?;
        let expected = base.as_ptr().wrapping_add(self.len as usize);
        if start.as_ptr() != expected {
            error!(?start, ?expected, "Grower handed out a non-contiguous region.");
            return Err(GrowError);
        }
        let old_len = self.len;
        self.len = new_len;
        Ok(old_len)
    }

    fn base(&self) -> Result<NonNull<u8>, GrowError> {
        self.base.ok_or(GrowError)
    }

    /// Returns a pointer to the word at `offset`.
    ///
    /// # Panics
    /// Panics if the heap is not attached, `offset` is not word-aligned or the word
    /// does not lie entirely inside the heap.
    #[inline]
    fn word_ptr(&self, offset: u32) -> *mut u32 {
        let Some(base) = self.base else {
            panic!("heap accessed before it was attached");
        };
        assert!(
            offset % HEADER_SIZE == 0 && offset as usize + HEADER_SIZE as usize <= self.len as usize,
            "word offset {offset:#x} is outside of the heap (size {:#x})",
            self.len
        );
        // In bounds of the region handed out by the grower.
        unsafe { base.as_ptr().add(offset as usize).cast::<u32>() }
    }

    /// Reads the word at `offset`.
    #[inline]
    pub fn get(&self, offset: u32) -> u32 {
        // Aligned since the base is 8-aligned and `offset` a multiple of 4.
        unsafe { self.word_ptr(offset).read() }
    }

    /// Writes the word at `offset`.
    #[inline]
    pub fn put(&mut self, offset: u32, value: u32) {
        unsafe { self.word_ptr(offset).write(value) }
    }

    #[inline]
    pub fn header(&self, block: BlockRef) -> Header {
        Header::from_raw(self.get(block.header()))
    }

    #[inline]
    pub fn footer(&self, block: BlockRef) -> Header {
        let size = self.header(block).size();
        Header::from_raw(self.get(block.footer(size)))
    }

    /// Size of `block` as recorded in its header.
    #[inline]
    pub fn size(&self, block: BlockRef) -> u32 {
        self.header(block).size()
    }

    /// Writes `tag` to both the header and the footer of `block`.
    /// The footer position is derived from the size in `tag`.
    #[inline]
    pub fn set_tags(&mut self, block: BlockRef, tag: Header) {
        self.put(block.header(), tag.raw());
        self.put(block.footer(tag.size()), tag.raw());
    }

    /// The footer of the block right before `block`.
    #[inline]
    pub fn prev_footer(&self, block: BlockRef) -> Header {
        Header::from_raw(self.get(block.prev_footer()))
    }

    /// The block right after `block`.
    #[inline]
    pub fn next(&self, block: BlockRef) -> BlockRef {
        block.next(self.size(block))
    }

    /// The block right before `block`.
    #[inline]
    pub fn prev(&self, block: BlockRef) -> BlockRef {
        block.prev(self.prev_footer(block).size())
    }

    /// Reads `block`'s state, including its free-list links if it is free.
    pub fn state(&self, block: BlockRef) -> BlockState {
        if self.header(block).is_allocated() {
            return BlockState::Allocated;
        }
        BlockState::Free {
            prev: BlockRef::from_link(self.get(block.offset())),
            next: BlockRef::from_link(self.get(block.offset() + HEADER_SIZE)),
        }
    }

    #[inline]
    pub fn set_prev_link(&mut self, block: BlockRef, prev: Option<BlockRef>) {
        debug_assert!(!self.header(block).is_allocated(), "links of an allocated block.");
        self.put(block.offset(), BlockRef::to_link(prev));
    }

    #[inline]
    pub fn set_next_link(&mut self, block: BlockRef, next: Option<BlockRef>) {
        debug_assert!(!self.header(block).is_allocated(), "links of an allocated block.");
        self.put(block.offset() + HEADER_SIZE, BlockRef::to_link(next));
    }

    /// Returns a pointer to `block`'s payload.
    ///
    /// # Panics
    /// Panics if the heap is not attached.
    pub fn payload(&self, block: BlockRef) -> NonNull<u8> {
        let Some(base) = self.base else {
            panic!("heap accessed before it was attached");
        };
        debug_assert!(block.offset() < self.len);
        unsafe { base.add(block.offset() as usize) }
    }

    /// Maps a payload pointer back to its block, or `None` if `ptr` does not point
    /// into the heap at an 8-aligned position past `first`.
    pub fn block_of(&self, ptr: NonNull<u8>, first: u32) -> Option<BlockRef> {
        let base = self.base?;
        let offset = (ptr.as_ptr() as usize).checked_sub(base.as_ptr() as usize)?;
        let offset = u32::try_from(offset).ok()?;
        if offset < first || offset >= self.len || offset as usize % GROWER_ALIGN != 0 {
            return None;
        }
        BlockRef::new(offset)
    }

    /// Copies `count` bytes from the payload of `src` to the payload of `dst`.
    ///
    /// # Panics
    /// Panics if either range leaves the heap or the two ranges overlap.
    pub fn copy(&mut self, src: BlockRef, dst: BlockRef, count: u32) {
        let (src, dst) = (src.offset() as usize, dst.offset() as usize);
        let count = count as usize;
        let len = self.len as usize;
        assert!(src + count <= len && dst + count <= len, "copy leaves the heap");
        assert!(src + count <= dst || dst + count <= src, "copy ranges overlap");
        let Some(base) = self.base else {
            panic!("heap accessed before it was attached");
        };
        unsafe {
            copy_nonoverlapping(
                base.as_ptr().add(src).cast_const(),
                base.as_ptr().add(dst),
                count,
            );
        }
    }
}

impl<G: Grower> fmt::Debug for Heap<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}
