//! Utility functions.

/// Returns the smallest (in address) `align`-aligned pointer
/// with an address greater or equal to that of `ptr`
/// or `None` if no such pointer exists.
///
/// # Panics
/// Panics if `align` is not a power-of-two.
#[inline]
pub(crate) fn find_aligned(ptr: *const u8, align: usize) -> Option<*const u8> {
    assert!(align.is_power_of_two(), "alignment should be a power of two.");
    let addr = ptr as usize;
    let aligned = addr.checked_add(align - 1)? & !(align - 1);
    Some(ptr.wrapping_add(aligned - addr))
}

#[inline(always)]
pub(crate) fn checked_add(ptr: *const u8, offset: usize) -> Option<*const u8> {
    (ptr as usize <= usize::MAX - offset).then_some(ptr.wrapping_add(offset))
}

/// Returns the smallest integer `z` such that `z ≥ x` and `z = y.k` for some integer `k`
/// or `None` if that integer can not be contained in a `usize`.
///
/// # Panics
/// Panics if `y` is 0.
#[inline]
pub(crate) fn find_divisible(x: usize, y: usize) -> Option<usize> {
    if x % y == 0 {
        Some(x)
    } else {
        ((x / y) * y).checked_add(y)
    }
}
