//! [`Grower`] trait and structures that implement it.
//!
//! A grower is the heap growth primitive: the [`SegMalloc`](crate::SegMalloc)
//! allocator never asks for memory in any other way, so swapping the grower
//! swaps the memory the allocator manages.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error};

use libc::{brk, sbrk};

use super::util::{checked_add, find_aligned};

/// Alignment of the start of every grower's buffer.
pub const GROWER_ALIGN: usize = 8;

/// The grower could not extend its buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GrowError;

impl fmt::Display for GrowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the heap could not be grown any further")
    }
}

impl std::error::Error for GrowError {}

/// A trait for types that act as if they were a contiguous growable buffer.
///
/// # Safety
/// Implementors must guarantee that:
/// * the first region handed out starts at a [`GROWER_ALIGN`]-aligned address;
/// * every successful `grow(size)` returns the old end of the buffer, so that
///   successive regions are contiguous, and the region is valid for reads and
///   writes of `size` bytes for as long as the grower lives;
/// * `grow(0)` returns the current end without growing;
/// * moving the grower does not invalidate any pointer into its buffer.
pub unsafe trait Grower {
    /// Grows the underlying buffer by exactly `size` bytes.
    /// Returns the old end of the buffer, i.e. the start of the new region,
    /// or [`GrowError`] if the buffer could not grow.
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError>;
}

unsafe impl<T: Grower + ?Sized> Grower for &mut T {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        (**self).grow(size)
    }
}

#[derive(Debug)]
/// A grower that internally uses [`libc::brk`] to operate
/// on the end of the process's data segment.
pub struct BrkGrower {
    heap_end: Option<NonNull<u8>>,
}

impl BrkGrower {
    /// # Safety
    /// Callers must make sure that no other object (grower, allocator or libc's
    /// own malloc) moves the program break for the lifetime of the grower.
    /// Growth fails once the break is found past the end of the heap.
    #[inline(always)]
    pub const unsafe fn new() -> Self {
        BrkGrower { heap_end: None }
    }

    /// Tries to initialize the grower by calling `sbrk(0)` to get the initial heap end.
    fn try_init(&mut self) -> Result<NonNull<u8>, GrowError> {
        debug_assert!(self.heap_end.is_none());
        let heap_end = unsafe { sbrk(0) };
        if heap_end as isize == -1 {
            return Err(GrowError);
        }
        let heap_end = find_aligned(heap_end.cast::<u8>(), GROWER_ALIGN).ok_or(GrowError)?;
        let heap_end = NonNull::new(heap_end as *mut u8).ok_or(GrowError)?;
        self.heap_end = Some(heap_end);
        Ok(heap_end)
    }
}

unsafe impl Grower for BrkGrower {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        let heap_end = match self.heap_end {
            Some(end) => end,
            None => self.try_init()?,
        };
        if size == 0 {
            return Ok(heap_end);
        }
        // Someone else moved the break past the heap, growing would shrink it back.
        if unsafe { sbrk(0) }.cast::<u8>() > heap_end.as_ptr() {
            return Err(GrowError);
        }
        let new_heap_end = checked_add(heap_end.as_ptr(), size).ok_or(GrowError)? as *mut u8;
        if unsafe { brk(new_heap_end.cast()) } == -1 {
            return Err(GrowError);
        }
        self.heap_end = NonNull::new(new_heap_end);
        Ok(heap_end)
    }
}

/// A grower that hands out a caller-provided buffer.
#[derive(Debug)]
pub struct ArenaGrower {
    heap_end: *mut u8,
    arena_end: *mut u8,
}

impl ArenaGrower {
    /// Creates a grower that operates on the `size` bytes starting at `buf`.
    /// The start is rounded up to [`GROWER_ALIGN`], which may cost a few bytes.
    ///
    /// # Safety
    /// `buf` must be non-null and valid for reads and writes of `size` bytes for the
    /// lifetime of the grower, and nothing else may access that memory meanwhile.
    pub unsafe fn new(buf: *mut u8, size: usize) -> Self {
        let arena_end = buf.wrapping_add(size);
        let heap_end = match find_aligned(buf, GROWER_ALIGN) {
            Some(p) if p <= arena_end.cast_const() => p as *mut u8,
            _ => arena_end,
        };
        ArenaGrower {
            heap_end,
            arena_end,
        }
    }

    /// Bytes that can still be handed out.
    pub fn remaining(&self) -> usize {
        self.arena_end as usize - self.heap_end as usize
    }
}

unsafe impl Grower for ArenaGrower {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        let heap_end = NonNull::new(self.heap_end).ok_or(GrowError)?;
        if size > self.remaining() {
            return Err(GrowError);
        }
        self.heap_end = self.heap_end.wrapping_add(size);
        Ok(heap_end)
    }
}

/// A grower that owns a fixed-capacity buffer and hands it out piece by piece,
/// failing once `capacity` bytes have been handed out.
pub struct BufferGrower {
    buf: NonNull<u8>,
    capacity: usize,
    len: usize,
}

impl BufferGrower {
    /// Allocates a zeroed buffer of `capacity` bytes from the system allocator.
    pub fn with_capacity(capacity: usize) -> Self {
        let layout = Self::layout(capacity);
        let buf = unsafe { alloc_zeroed(layout) };
        let Some(buf) = NonNull::new(buf) else {
            handle_alloc_error(layout);
        };
        BufferGrower {
            buf,
            capacity,
            len: 0,
        }
    }

    /// Bytes handed out so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::from_size_align(capacity.max(1), GROWER_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("buffer capacity {capacity} is too large"),
        }
    }
}

unsafe impl Grower for BufferGrower {
    fn grow(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        if size > self.capacity - self.len {
            return Err(GrowError);
        }
        let heap_end = unsafe { self.buf.add(self.len) };
        self.len += size;
        Ok(heap_end)
    }
}

impl Drop for BufferGrower {
    fn drop(&mut self) {
        unsafe { dealloc(self.buf.as_ptr(), Self::layout(self.capacity)) };
    }
}

impl fmt::Debug for BufferGrower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGrower")
            .field("buf", &self.buf)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}
