//! A singlethreaded segregated free-list allocator.
//!
// For a general view of the allocator's operational semantics see the [`crate`] level documentation.
//
// # Additional implementation notes
// ## Heap layout
// The first `CLASS_COUNT` words of the heap are the free-list heads, followed by one
// padding word, the prologue block (header and footer, no payload) and finally the
// epilogue header. Heap extensions turn the old epilogue header into the header
// of the new free block and write a fresh epilogue past it, so every real block
// always has a tagged neighbor on both sides.
//
// ## Block sizes
// Requests are turned into block sizes by `util::adjust_size`; every block size is
// a multiple of `DWORD_SIZE` and at least `MIN_BLOCK_SIZE`. Payloads start one word
// past an 8-aligned header offset + 4, which keeps every payload 8-aligned.

use self::util::adjust_size;
use crate::block::BlockRef;
use crate::freelist::{classify, CLASS_COUNT};
use crate::growers::{GrowError, Grower};
use crate::header::{Header, HEADER_SIZE};
use crate::heap::{AttachError, Heap};

use core::fmt;
use core::ptr::NonNull;

use static_assertions::const_assert;
use tracing::{debug, error, instrument, Level};

pub use self::check::{BlockInfo, Blocks, HeapError, HeapStats};

mod check;
mod util;

/// Size of a heap word (and of a boundary tag).
pub const WORD_SIZE: u32 = HEADER_SIZE;
/// Block alignment and granularity.
pub const DWORD_SIZE: u32 = 2 * WORD_SIZE;
/// Minimum heap extension, the size of the first free block.
pub const CHUNK_SIZE: u32 = 1 << 12;
/// Smallest block: header, footer and two free-list links.
pub const MIN_BLOCK_SIZE: u32 = 2 * DWORD_SIZE;

/// Bytes reserved by [`SegMalloc::init`] before the first extension:
/// list heads, padding, prologue header and footer, epilogue header.
const RESERVED_SIZE: u32 = (CLASS_COUNT as u32 + 4) * WORD_SIZE;

const PROLOGUE_SIZE: u32 = DWORD_SIZE;

const PROLOGUE: BlockRef = match BlockRef::new((CLASS_COUNT as u32 + 2) * WORD_SIZE) {
    Some(block) => block,
    None => panic!("the prologue can not sit at the heap base"),
};

/// Payload offset of the first block after the prologue.
const FIRST_BLOCK: u32 = RESERVED_SIZE;

const_assert!(MIN_BLOCK_SIZE >= 4 * WORD_SIZE);
const_assert!(RESERVED_SIZE % DWORD_SIZE == 0);
const_assert!(PROLOGUE.offset() % DWORD_SIZE == 0);
const_assert!(PROLOGUE.offset() + PROLOGUE_SIZE == FIRST_BLOCK);
const_assert!(CHUNK_SIZE % DWORD_SIZE == 0);

/// Why [`SegMalloc::init`] failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitError {
    /// The grower could not provide the initial heap.
    HeapExhausted,
    /// The grower handed out a heap base that is not 8-aligned.
    Misaligned,
    /// The allocator was already initialized.
    AlreadyInitialized,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::HeapExhausted => f.write_str("heap exhausted while initializing the allocator"),
            InitError::Misaligned => f.write_str("the heap base is not 8-byte aligned"),
            InitError::AlreadyInitialized => f.write_str("the allocator is already initialized"),
        }
    }
}

impl std::error::Error for InitError {}

impl From<AttachError> for InitError {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::Grow(GrowError) => InitError::HeapExhausted,
            AttachError::Misaligned => InitError::Misaligned,
        }
    }
}

/// A single threaded memory allocator over the memory of a [`Grower`].
pub struct SegMalloc<G: Grower> {
    heap: Heap<G>,
}

impl<G: Grower> fmt::Debug for SegMalloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegMalloc")
            .field("heap", &self.heap)
            .finish()
    }
}

impl<G: Grower> SegMalloc<G> {
    /// Creates an allocator instance with the specified grower.
    /// No memory is requested until [`init`](SegMalloc::init) or the first allocation.
    pub const fn new(grower: G) -> Self {
        SegMalloc {
            heap: Heap::new(grower),
        }
    }

    /// Sets up the list heads and the sentinel blocks, then extends the heap
    /// by [`CHUNK_SIZE`] bytes to seed the first free block.
    ///
    /// If only the seeding extension failed, calling `init` again retries it.
    #[instrument(level = "info", err(Debug, level = Level::ERROR))]
    pub fn init(&mut self) -> Result<(), InitError> {
        if self.is_initialized() {
            return Err(InitError::AlreadyInitialized);
        }
        if !self.heap.is_attached() {
            self.heap.attach(RESERVED_SIZE)?;

            self.heap.clear_classes();
            self.heap.put(CLASS_COUNT as u32 * WORD_SIZE, 0);
            self.heap.set_tags(PROLOGUE, Header::new(PROLOGUE_SIZE, true));
            self.heap
                .put(FIRST_BLOCK - WORD_SIZE, Header::new(0, true).raw());
        } else {
            debug!("Sentinels are in place, retrying the first extension.");
        }

        self.extend_heap(CHUNK_SIZE / WORD_SIZE)
            .map_err(|GrowError| InitError::HeapExhausted)?;
        Ok(())
    }

    /// Allocates a block with room for at least `size` bytes and returns a pointer
    /// to its 8-aligned payload, or `None` if `size` is 0 or the heap can not grow.
    ///
    /// An allocator that was never initialized is initialized first.
    #[instrument(level = "info", ret(level = Level::INFO))]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        let block = self.allocate_block(size)?;
        Some(self.heap.payload(block))
    }

    /// Frees the block whose payload starts at `ptr`.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](SegMalloc::allocate) or
    /// [`reallocate`](SegMalloc::reallocate) of this allocator and must not have
    /// been freed since. Debug builds check the block's tags and panic on a
    /// violation; pointers outside of the heap always panic.
    #[instrument(level = "info")]
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        let block = self.allocated_block(ptr);
        let tag = self.heap.header(block);
        self.heap.set_tags(block, tag.freed());
        self.merge(block);
    }

    /// Moves the allocation at `ptr` to a block with room for `size` bytes.
    ///
    /// A `None` pointer makes this an [`allocate`](SegMalloc::allocate), a zero `size`
    /// a [`deallocate`](SegMalloc::deallocate). Otherwise a new block is always
    /// allocated, the first `min(old block size, size)` bytes are copied over and the
    /// old block is freed. If the new block can not be allocated `None` is returned
    /// and the old block is left untouched.
    ///
    /// # Safety
    /// Same as [`deallocate`](SegMalloc::deallocate) for a `Some` pointer.
    #[instrument(level = "info", ret(level = Level::INFO))]
    pub unsafe fn reallocate(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(ptr) = ptr else {
            return self.allocate(size);
        };
        if size == 0 {
            self.deallocate(ptr);
            return None;
        }

        let old_block = self.allocated_block(ptr);
        let old_size = self.heap.size(old_block);

        let Some(new_block) = self.allocate_block(size) else {
            debug!("Couldn't allocate a new block, the old one is kept.");
            return None;
        };
        let count = u32::try_from(size).map_or(old_size, |size| size.min(old_size));
        debug!(?old_block, ?new_block, count, "Copying payload.");
        self.heap.copy(old_block, new_block, count);

        self.deallocate(ptr);
        Some(self.heap.payload(new_block))
    }

    /// Returns whether the allocator has set up its heap, first free block included.
    pub fn is_initialized(&self) -> bool {
        // The heap never shrinks, so it is seeded once it holds more than the sentinels.
        self.heap.is_attached() && self.heap.len() > RESERVED_SIZE
    }

    /// Current size of the heap in bytes.
    pub fn heap_size(&self) -> usize {
        self.heap.len() as usize
    }

    /// Returns the size of the block holding the allocation at `ptr`,
    /// header and footer included.
    ///
    /// # Safety
    /// Same as [`deallocate`](SegMalloc::deallocate).
    pub unsafe fn block_size(&self, ptr: NonNull<u8>) -> usize {
        self.heap.size(self.allocated_block(ptr)) as usize
    }

    /// Returns how many bytes the allocation at `ptr` may use.
    ///
    /// # Safety
    /// Same as [`deallocate`](SegMalloc::deallocate).
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.block_size(ptr) - DWORD_SIZE as usize
    }
}

impl<G: Grower> SegMalloc<G> {
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    fn allocate_block(&mut self, size: usize) -> Option<BlockRef> {
        if size == 0 {
            debug!("Zero-sized request, nothing to allocate.");
            return None;
        }
        if !self.is_initialized() {
            debug!("Allocator isn't initialized, initializing.");
            self.init().ok()?;
        }
        let Some(block_size) = adjust_size(size) else {
            error!(size, "Request is too large for a block.");
            return None;
        };
        debug!(block_size, "Size adjusted.");

        let block = match self.find_fit(block_size) {
            Some(block) => {
                debug!(?block, "Found free block to accomodate request.");
                block
            }
            None => {
                debug!("Couldn't find free block to accomodate request, requesting heap growth.");
                match self.extend_heap(block_size.max(CHUNK_SIZE) / WORD_SIZE) {
                    Ok(block) => block,
                    Err(GrowError) => {
                        error!(block_size, "Allocation failure, no memory.");
                        return None;
                    }
                }
            }
        };

        self.place(block, block_size);
        Some(block)
    }

    /// Grows the heap by `words` words (rounded up to an even count) and turns the
    /// new region into a free block, merged with a free block that ended the heap.
    /// Returns the resulting free block.
    #[instrument(level = "debug", ret(level = Level::DEBUG), err(Debug, level = Level::ERROR))]
    fn extend_heap(&mut self, words: u32) -> Result<BlockRef, GrowError> {
        let size = words
            .checked_add(words % 2)
            .and_then(|words| words.checked_mul(WORD_SIZE))
            .ok_or(GrowError)?;

        let start = self.heap.grow(size)?;
        let block = BlockRef::new(start).ok_or(GrowError)?;
        debug!(?block, size, "Heap grown.");

        // The new header overwrites the old epilogue.
        self.heap.set_tags(block, Header::new(size, false));
        let epilogue = self.heap.next(block);
        self.heap.put(epilogue.header(), Header::new(0, true).raw());

        Ok(self.merge(block))
    }

    /// Merges the free `block` with its free neighbors and files the result in
    /// the free lists. Returns the merged block, which starts at the previous
    /// block if that one was free.
    ///
    /// `block` must already be tagged free and must not be in any list.
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    fn merge(&mut self, block: BlockRef) -> BlockRef {
        let heap = &mut self.heap;
        debug_assert!(!heap.header(block).is_allocated(), "Merged block should be free.");

        let prev_allocated = heap.prev_footer(block).is_allocated();
        let next = heap.next(block);
        let next_allocated = heap.header(next).is_allocated();
        let mut size = heap.size(block);

        let block = match (prev_allocated, next_allocated) {
            (true, true) => {
                debug!("Both neighbors are allocated, nothing to merge.");
                block
            }
            (true, false) => {
                heap.remove(next);
                size += heap.size(next);
                heap.set_tags(block, Header::new(size, false));
                debug!(?next, size, "Merged with the next block.");
                block
            }
            (false, true) => {
                let prev = heap.prev(block);
                heap.remove(prev);
                size += heap.size(prev);
                heap.set_tags(prev, Header::new(size, false));
                debug!(?prev, size, "Merged with the previous block.");
                prev
            }
            (false, false) => {
                let prev = heap.prev(block);
                heap.remove(prev);
                heap.remove(next);
                size += heap.size(prev) + heap.size(next);
                heap.set_tags(prev, Header::new(size, false));
                debug!(?prev, ?next, size, "Merged with both neighbors.");
                prev
            }
        };

        heap.insert(block);
        block
    }

    /// Looks for a free block of at least `size` bytes. Classes are searched from
    /// `size`'s own class upwards; inside the first class that has a large enough
    /// block, the smallest such block wins.
    #[instrument(level = "debug", ret(level = Level::DEBUG))]
    fn find_fit(&self, size: u32) -> Option<BlockRef> {
        (classify(size)..CLASS_COUNT).find_map(|class| {
            self.heap
                .class_members(class)
                .filter(|&block| self.heap.size(block) >= size)
                .min_by_key(|&block| self.heap.size(block))
        })
    }

    /// Allocates `size` bytes of the free `block`, splitting off the rest as a new
    /// free block if it can hold a block of its own.
    #[instrument(level = "debug")]
    fn place(&mut self, block: BlockRef, size: u32) {
        let heap = &mut self.heap;
        let block_size = heap.size(block);
        debug_assert!(block_size >= size);

        heap.remove(block);
        let rest = block_size - size;
        if rest >= MIN_BLOCK_SIZE {
            heap.set_tags(block, Header::new(size, true));
            let remainder = block.next(size);
            heap.set_tags(remainder, Header::new(rest, false));
            heap.insert(remainder);
            debug!(?remainder, rest, "Split off a free block.");
        } else {
            heap.set_tags(block, Header::new(block_size, true));
            debug!(block_size, "Remainder too small, allocating the whole block.");
        }
    }

    /// Maps a caller's pointer back to its block.
    ///
    /// # Panics
    /// Panics if `ptr` is not an 8-aligned pointer into the heap. In debug builds
    /// also panics if the block is not allocated or its tags disagree.
    fn allocated_block(&self, ptr: NonNull<u8>) -> BlockRef {
        let Some(block) = self.heap.block_of(ptr, FIRST_BLOCK) else {
            panic!("{ptr:?} does not point to an allocation of this allocator");
        };
        debug_assert!(
            self.heap.header(block).is_allocated(),
            "{ptr:?} does not point to an allocated block (double free?)"
        );
        debug_assert_eq!(
            self.heap.header(block),
            self.heap.footer(block),
            "Header and footer of {ptr:?} disagree."
        );
        block
    }
}

#[cfg(test)]
mod tests;
