//! A segregated free-list memory allocator with boundary tags and immediate coalescing.
//!
//! # Usage
//! ```
//! use seglist_malloc::growers::BufferGrower;
//! use seglist_malloc::SegMalloc;
//!
//! let mut allocator = SegMalloc::new(BufferGrower::with_capacity(1 << 20));
//! allocator.init().unwrap();
//!
//! let p = allocator.allocate(100).unwrap();
//! assert_eq!(p.as_ptr() as usize % 8, 0);
//! let q = unsafe { allocator.reallocate(Some(p), 300) }.unwrap();
//! unsafe { allocator.deallocate(q) };
//!
//! let stats = allocator.check_heap().unwrap();
//! assert_eq!(stats.free_blocks, 1);
//! ```
//!
//! # Mode of operation
//! The allocator manages a single contiguous heap that only ever grows:
//! - When an allocation is requested the size is turned into a block size and the
//!   [free lists](#segregated-free-lists) are searched, starting with the list of the
//!   block size's own class. The smallest large enough block of the first class that
//!   has one is taken, and split if the leftover can form a block of its own.
//! - If no block is found the heap is extended through the allocator's
//!   [grower](#growers), by at least [`CHUNK_SIZE`] bytes, and the new space is used.
//! - On deallocation the block is marked free and immediately merged with any free
//!   neighbor, so no two free blocks are ever adjacent. The merged block is then filed
//!   in its class's list.
//! - Reallocation always moves: it allocates, copies and frees.
//!
//! Below is a list of the abstractions used by the allocator for operating on the heap:
//!
//! ## Blocks
//! The heap is divided into blocks. Each block starts with a header and ends with a
//! footer, both holding the block size and whether the block is allocated. These
//! duplicated boundary tags let the allocator step from any block to both of its
//! neighbors. Block sizes are multiples of 8 and at least [`MIN_BLOCK_SIZE`] bytes.
//!
//! The heap begins with the free-list heads and a prologue block and ends with a
//! zero-sized epilogue header, both marked allocated, so the first and last real
//! blocks never need special treatment.
//!
//! ## Segregated free lists
//! Free blocks are kept in 20 doubly-linked lists, one per size class: class `k`
//! holds blocks of at most `2^(k + 4)` bytes and the last class everything larger.
//! The links are stored inside the payload of the free blocks themselves, as offsets
//! from the heap base, so insertion and removal are *O*(1) and cost no extra memory.
//!
//! ## Growers
//! A grower is the allocator's source of memory. [`SegMalloc`] is generic over its
//! grower, so anything that implements [`Grower`] (anything that acts as a
//! contiguous buffer which can grow) can back it: the program break
//! ([`BrkGrower`]), a caller-provided buffer ([`ArenaGrower`]) or an owned buffer
//! with a fixed capacity ([`BufferGrower`]).
//!
//! # Safety
//! All heap accesses go through bounds-checked offsets, so a corrupted heap makes
//! the allocator panic rather than touch memory it does not own. Handing a pointer
//! to [`SegMalloc::deallocate`] that it did not allocate, or freeing twice, is
//! still a contract violation; debug builds detect most such misuse.
//!
//! [`CHUNK_SIZE`]: allocators::seg_malloc::CHUNK_SIZE
//! [`MIN_BLOCK_SIZE`]: allocators::seg_malloc::MIN_BLOCK_SIZE
//! [`Grower`]: growers::Grower
//! [`BrkGrower`]: growers::BrkGrower
//! [`ArenaGrower`]: growers::ArenaGrower
//! [`BufferGrower`]: growers::BufferGrower

pub use crate::allocators::seg_malloc::{BlockInfo, HeapError, HeapStats, InitError};
pub use crate::allocators::SegMalloc;

pub mod allocators;
mod block;
mod freelist;
pub mod growers;
mod header;
mod heap;
mod util;
