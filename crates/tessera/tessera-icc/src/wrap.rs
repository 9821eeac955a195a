//! Copy-in / copy-out over circular byte storage.
//!
//! A copy that runs past the end of the storage is split into two contiguous
//! `memcpy`s: the tail of the storage, then its head.

use std::cell::UnsafeCell;
use std::ptr;

/// Copies `src` into `buffer` starting at `offset mod buffer.len()`, wrapping
/// past the end.
///
/// `src` must not be longer than `buffer`.
///
/// ```
/// let mut ring = [0u8; 8];
/// tessera_icc::copy_in(&mut ring, 6, &[1, 2, 3, 4]);
/// assert_eq!(ring, [3, 4, 0, 0, 0, 0, 1, 2]);
/// ```
pub fn copy_in(buffer: &mut [u8], offset: usize, src: &[u8]) {
    assert!(src.len() <= buffer.len(), "copy longer than ring");
    // SAFETY: exclusive borrow of `buffer`, length checked above
    unsafe { copy_in_raw(buffer.as_mut_ptr(), buffer.len(), offset, src) }
}

/// Fills `dst` from `buffer` starting at `offset mod buffer.len()`, wrapping
/// past the end.
///
/// ```
/// let ring = [3, 4, 0, 0, 0, 0, 1, 2];
/// let mut out = [0u8; 4];
/// tessera_icc::copy_out(&ring, 14, &mut out);
/// assert_eq!(out, [1, 2, 3, 4]);
/// ```
pub fn copy_out(buffer: &[u8], offset: usize, dst: &mut [u8]) {
    assert!(dst.len() <= buffer.len(), "copy longer than ring");
    // SAFETY: shared borrow of `buffer`, length checked above
    unsafe { copy_out_raw(buffer.as_ptr(), buffer.len(), offset, dst) }
}

/// # Safety
/// `base` must be valid for writes of `cap` bytes, `src.len() <= cap`, and no
/// other thread may access the written range concurrently.
#[inline(always)]
unsafe fn copy_in_raw(base: *mut u8, cap: usize, offset: usize, src: &[u8]) {
    // Also covers `cap == 0`, where `offset % cap` would panic.
    if src.is_empty() {
        return;
    }
    let start = offset % cap;
    let first = src.len().min(cap - start);
    unsafe {
        ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
        if src.len() > first {
            ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }
}

/// # Safety
/// `base` must be valid for reads of `cap` bytes and `dst.len() <= cap`.
#[inline(always)]
unsafe fn copy_out_raw(base: *const u8, cap: usize, offset: usize, dst: &mut [u8]) {
    if dst.is_empty() {
        return;
    }
    let start = offset % cap;
    let first = dst.len().min(cap - start);
    unsafe {
        ptr::copy_nonoverlapping(base.add(start), dst.as_mut_ptr(), first);
        if dst.len() > first {
            ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }
}

/// Fixed-capacity byte storage shared between a ring's producer and its
/// consumers.
///
/// Access is unsynchronised; the owning ring's cursor protocol decides which
/// ranges each side may touch.
pub(crate) struct ByteStorage {
    cells: Box<[UnsafeCell<u8>]>,
}

impl ByteStorage {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    #[inline(always)]
    pub(crate) fn capacity(&self) -> usize {
        self.cells.len()
    }

    #[inline(always)]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.cells.as_ptr())
    }

    /// # Safety
    /// The caller must own `[offset, offset + src.len())` (mod capacity) for
    /// writing under the ring protocol.
    #[inline(always)]
    pub(crate) unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        debug_assert!(src.len() <= self.capacity());
        unsafe { copy_in_raw(self.base(), self.capacity(), offset, src) }
    }

    /// # Safety
    /// The range must be published to the caller under the ring protocol, or
    /// the caller must validate the copied bytes before trusting them.
    #[inline(always)]
    pub(crate) unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(dst.len() <= self.capacity());
        unsafe { copy_out_raw(self.base(), self.capacity(), offset, dst) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_copy() {
        let mut ring = [0u8; 8];
        copy_in(&mut ring, 2, &[7, 8, 9]);
        assert_eq!(ring, [0, 0, 7, 8, 9, 0, 0, 0]);

        let mut out = [0u8; 3];
        copy_out(&ring, 2, &mut out);
        assert_eq!(out, [7, 8, 9]);
    }

    #[test]
    fn offset_is_reduced_modulo_capacity() {
        let mut ring = [0u8; 8];
        copy_in(&mut ring, 8 * 5 + 1, &[0xAA]);
        assert_eq!(ring[1], 0xAA);
    }

    #[test]
    fn copy_of_full_capacity_from_middle() {
        let mut ring = [0u8; 4];
        copy_in(&mut ring, 3, &[1, 2, 3, 4]);
        assert_eq!(ring, [2, 3, 4, 1]);

        let mut out = [0u8; 4];
        copy_out(&ring, 3, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn storage_wraps_like_slices() {
        let storage = ByteStorage::new(8);
        let mut out = [0u8; 5];
        unsafe {
            storage.copy_in(5, &[1, 2, 3, 4, 5]);
            storage.copy_out(5, &mut out);
        }
        assert_eq!(out, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn empty_copy_is_noop() {
        copy_in(&mut [], 0, &[]);
        copy_out(&[], 3, &mut []);

        let mut ring = [5u8; 4];
        copy_in(&mut ring, 9, &[]);
        assert_eq!(ring, [5; 4]);
    }

    #[test]
    #[should_panic(expected = "longer than ring")]
    fn oversized_copy_panics() {
        let mut ring = [0u8; 2];
        copy_in(&mut ring, 0, &[1, 2, 3]);
    }
}
