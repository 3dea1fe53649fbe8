//! Heap walking and consistency checking.

use super::{SegMalloc, FIRST_BLOCK, MIN_BLOCK_SIZE, PROLOGUE, PROLOGUE_SIZE};
use crate::block::{BlockRef, BlockState};
use crate::freelist::{classify, CLASS_COUNT};
use crate::growers::Grower;
use crate::header::{Header, HEADER_SIZE};
use crate::heap::Heap;

use core::fmt;
use core::ptr::NonNull;
use std::collections::BTreeSet;

use tracing::{debug, instrument, Level};

/// A block as seen by a heap walk.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the payload from the heap base.
    pub offset: usize,
    /// Block size, header and footer included.
    pub size: usize,
    pub allocated: bool,
    pub payload: NonNull<u8>,
}

/// Iterator over the blocks between the prologue and the epilogue, in address order.
pub struct Blocks<'a, G: Grower> {
    heap: &'a Heap<G>,
    cursor: Option<BlockRef>,
}

impl<G: Grower> Iterator for Blocks<'_, G> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let block = self.cursor?;
        let tag = self.heap.header(block);
        if tag.size() == 0 {
            // Epilogue.
            self.cursor = None;
            return None;
        }
        self.cursor = Some(block.next(tag.size()));
        Some(BlockInfo {
            offset: block.offset() as usize,
            size: tag.size() as usize,
            allocated: tag.is_allocated(),
            payload: self.heap.payload(block),
        })
    }
}

/// Summary of a consistent heap.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_size: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_bytes: usize,
}

/// A broken heap invariant, with the payload offset of the offending block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    Uninitialized,
    BadPrologue,
    BadEpilogue { offset: usize },
    Misaligned { offset: usize },
    TagMismatch { offset: usize },
    BlockTooSmall { offset: usize, size: usize },
    AdjacentFree { offset: usize },
    /// A list links to something that is not a free block, or reaches a block twice.
    StrayListNode { class: usize, offset: usize },
    WrongClass { class: usize, offset: usize },
    BrokenLink { offset: usize },
    /// A free block that no list reaches.
    Unlisted { offset: usize },
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HeapError::Uninitialized => write!(f, "heap is not initialized"),
            HeapError::BadPrologue => write!(f, "prologue block is corrupted"),
            HeapError::BadEpilogue { offset } => {
                write!(f, "heap walk ended at {offset:#x} instead of the epilogue")
            }
            HeapError::Misaligned { offset } => write!(f, "block {offset:#x} is misaligned"),
            HeapError::TagMismatch { offset } => {
                write!(f, "header and footer of block {offset:#x} disagree")
            }
            HeapError::BlockTooSmall { offset, size } => {
                write!(f, "block {offset:#x} has size {size}, below the minimum")
            }
            HeapError::AdjacentFree { offset } => {
                write!(f, "free block {offset:#x} follows another free block")
            }
            HeapError::StrayListNode { class, offset } => {
                write!(f, "list {class} reaches {offset:#x}, which is not an unvisited free block")
            }
            HeapError::WrongClass { class, offset } => {
                write!(f, "block {offset:#x} is filed in the wrong list {class}")
            }
            HeapError::BrokenLink { offset } => {
                write!(f, "links of block {offset:#x} are inconsistent")
            }
            HeapError::Unlisted { offset } => write!(f, "free block {offset:#x} is in no list"),
        }
    }
}

impl std::error::Error for HeapError {}

impl<G: Grower> SegMalloc<G> {
    /// Walks the heap block by block, in address order.
    pub fn blocks(&self) -> Blocks<'_, G> {
        let cursor = match self.heap.is_attached() {
            true => BlockRef::new(FIRST_BLOCK),
            false => None,
        };
        Blocks {
            heap: &self.heap,
            cursor,
        }
    }

    /// Verifies every heap invariant: sentinels, matching tags, alignment, minimum
    /// sizes, no adjacent free blocks, and that the free lists hold exactly the free
    /// blocks, each in its own class, with consistent links.
    #[instrument(level = "debug", skip(self), ret(level = Level::DEBUG), err(Debug, level = Level::DEBUG))]
    pub fn check_heap(&self) -> Result<HeapStats, HeapError> {
        if !self.is_initialized() {
            return Err(HeapError::Uninitialized);
        }
        let heap = &self.heap;

        let prologue = Header::new(PROLOGUE_SIZE, true);
        if heap.header(PROLOGUE) != prologue || heap.footer(PROLOGUE) != prologue {
            return Err(HeapError::BadPrologue);
        }

        let mut stats = HeapStats {
            heap_size: heap.len() as usize,
            ..HeapStats::default()
        };
        let mut free = BTreeSet::new();
        let mut prev_free = false;
        let mut end = FIRST_BLOCK as usize;

        for block in self.blocks() {
            let offset = block.offset;
            end = offset + block.size;
            if offset % 8 != 0 {
                return Err(HeapError::Misaligned { offset });
            }
            if block.size < MIN_BLOCK_SIZE as usize {
                return Err(HeapError::BlockTooSmall {
                    offset,
                    size: block.size,
                });
            }
            // Walked blocks have in-heap offsets.
            let block_ref = BlockRef::new(offset as u32).ok_or(HeapError::Misaligned { offset })?;
            if end > heap.len() as usize || heap.header(block_ref) != heap.footer(block_ref) {
                return Err(HeapError::TagMismatch { offset });
            }

            stats.blocks += 1;
            if block.allocated {
                stats.allocated_bytes += block.size;
            } else {
                if prev_free {
                    return Err(HeapError::AdjacentFree { offset });
                }
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                free.insert(block_ref);
            }
            prev_free = !block.allocated;
        }

        // The walk stops at a zero-sized header, which must be the epilogue in the last word.
        if end != heap.len() as usize || heap.get(heap.len() - HEADER_SIZE) != Header::new(0, true).raw() {
            return Err(HeapError::BadEpilogue { offset: end });
        }

        for class in 0..CLASS_COUNT {
            self.check_class(class, &mut free)?;
        }
        if let Some(block) = free.first() {
            return Err(HeapError::Unlisted {
                offset: block.offset() as usize,
            });
        }

        debug!(?stats, "Heap is consistent.");
        Ok(stats)
    }

    /// Walks `class`'s list, removing every member from `unvisited`.
    fn check_class(&self, class: usize, unvisited: &mut BTreeSet<BlockRef>) -> Result<(), HeapError> {
        let heap = &self.heap;
        let mut expected_prev = None;
        let mut cursor = heap.class_head(class);

        while let Some(block) = cursor {
            let offset = block.offset() as usize;
            if !unvisited.remove(&block) {
                return Err(HeapError::StrayListNode { class, offset });
            }
            if classify(heap.size(block)) != class {
                return Err(HeapError::WrongClass { class, offset });
            }
            let BlockState::Free { prev, next } = heap.state(block) else {
                return Err(HeapError::StrayListNode { class, offset });
            };
            if prev != expected_prev {
                return Err(HeapError::BrokenLink { offset });
            }
            expected_prev = Some(block);
            cursor = next;
        }
        Ok(())
    }
}
