//! The segregated free lists.
//!
//! Free blocks are filed by size into [`CLASS_COUNT`] doubly-linked lists. The
//! list heads live in the first [`CLASS_COUNT`] words of the heap and the links
//! live in the first two payload words of every free block, so the lists cost no
//! memory outside the heap.

use crate::block::{BlockRef, BlockState};
use crate::growers::Grower;
use crate::header::HEADER_SIZE;
use crate::heap::Heap;

/// Number of size classes.
pub const CLASS_COUNT: usize = 20;

/// log2 of the upper bound of class 0.
const FIRST_CLASS_SHIFT: u32 = 4;

/// Returns the size class of a free block of `size` bytes: the smallest class
/// `k` with `size <= 2^(k + 4)`, the last class taking everything larger.
#[inline]
pub fn classify(size: u32) -> usize {
    (0..CLASS_COUNT)
        .find(|&class| size as u64 <= 1_u64 << (class as u32 + FIRST_CLASS_SHIFT))
        .unwrap_or(CLASS_COUNT - 1)
}

/// Heap offset of the head word of `class`.
#[inline(always)]
const fn head_offset(class: usize) -> u32 {
    class as u32 * HEADER_SIZE
}

impl<G: Grower> Heap<G> {
    /// Returns the first block of `class`'s list.
    #[inline]
    pub fn class_head(&self, class: usize) -> Option<BlockRef> {
        debug_assert!(class < CLASS_COUNT);
        BlockRef::from_link(self.get(head_offset(class)))
    }

    #[inline]
    fn set_class_head(&mut self, class: usize, head: Option<BlockRef>) {
        self.put(head_offset(class), BlockRef::to_link(head));
    }

    /// Empties every list.
    pub fn clear_classes(&mut self) {
        for class in 0..CLASS_COUNT {
            self.set_class_head(class, None);
        }
    }

    /// Reads the links of a block that is expected to be free.
    #[inline]
    fn links(&self, block: BlockRef) -> (Option<BlockRef>, Option<BlockRef>) {
        match self.state(block) {
            BlockState::Free { prev, next } => (prev, next),
            BlockState::Allocated => panic!("{block:?} is allocated but was used as a free-list node"),
        }
    }

    /// Pushes `block` onto the front of its class's list.
    /// This operation has a time complexity of *O*(1).
    ///
    /// The block's tags must already mark it free; its links are overwritten.
    pub fn insert(&mut self, block: BlockRef) {
        let class = classify(self.size(block));
        let head = self.class_head(class);

        self.set_prev_link(block, None);
        self.set_next_link(block, head);
        if let Some(head) = head {
            self.set_prev_link(head, Some(block));
        }
        self.set_class_head(class, Some(block));
    }

    /// Removes `block` from its class's list.
    /// This operation has a time complexity of *O*(1).
    ///
    /// The block must currently be a member of the list its size maps to.
    pub fn remove(&mut self, block: BlockRef) {
        let class = classify(self.size(block));
        let (prev, next) = self.links(block);

        match prev {
            Some(prev) => self.set_next_link(prev, next),
            None => {
                debug_assert_eq!(self.class_head(class), Some(block), "unlinked block removed.");
                self.set_class_head(class, next);
            }
        }
        if let Some(next) = next {
            self.set_prev_link(next, prev);
        }
    }

    /// Iterates over the members of `class`'s list, front to back.
    pub fn class_members(&self, class: usize) -> ClassMembers<'_, G> {
        ClassMembers {
            heap: self,
            cursor: self.class_head(class),
        }
    }
}

pub(crate) struct ClassMembers<'h, G: Grower> {
    heap: &'h Heap<G>,
    cursor: Option<BlockRef>,
}

impl<G: Grower> Iterator for ClassMembers<'_, G> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        let block = self.cursor?;
        self.cursor = self.heap.links(block).1;
        Some(block)
    }
}
