//! Defines the [`Header`] boundary tag and associated constants.

use core::mem::size_of;

/// Size of a boundary tag, which is also the heap's word size.
pub const HEADER_SIZE: u32 = size_of::<Header>() as u32;

const ALLOC_BIT: u32 = 1;
const SIZE_MASK: u32 = !0x7;

/// A boundary tag, stored both at the start (header) and at the end (footer)
/// of every block.
///
/// # Packing
/// Block sizes are always multiples of 8 so the three low bits of the size are
/// free. The lowest one records whether the block is allocated, the other two
/// are always zero.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Header(u32);

impl Header {
    /// Packs a block size and allocation status into a tag.
    ///
    /// # Panics
    /// In debug builds, panics if `size` is not a multiple of 8.
    #[inline(always)]
    pub const fn new(size: u32, allocated: bool) -> Header {
        debug_assert!(size & !SIZE_MASK == 0, "block size should be a multiple of 8.");
        Header(size | allocated as u32)
    }

    /// Reinterprets a raw word read from the heap.
    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Header {
        Header(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the size of the whole block, header and footer included.
    #[inline(always)]
    pub const fn size(self) -> u32 {
        self.0 & SIZE_MASK
    }

    #[inline(always)]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    /// Returns the same tag marked as free.
    #[inline(always)]
    pub const fn freed(self) -> Header {
        Header(self.0 & !ALLOC_BIT)
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}
