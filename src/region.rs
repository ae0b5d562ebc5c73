//! Definition of memory regions that back a ring buffer.

use memmap2::{MmapMut, MmapOptions};
use std::{cmp::min, io, ptr};
use thiserror::Error;

/// Region used by a [`crate::RingBuffer`] when none is specified.
///
/// Hosts that support aliasing the same memory twice get a [`crate::MirroredRegion`],
/// everybody else falls back to [`SplitRegion`].
#[cfg(unix)]
pub type DefaultRegion = crate::MirroredRegion;

/// Region used by a [`crate::RingBuffer`] when none is specified.
#[cfg(not(unix))]
pub type DefaultRegion = SplitRegion;

/// Different steps that can fail when memory for a ring buffer is mapped.
///
/// Anything acquired before the failing step is released before the error
/// is returned, so a failed construction never leaks address space.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("Ring order {0} does not fit in addressable memory")]
    Order(u32),

    #[error("Region capacity {0} is not a page aligned power of 2 that fits in addressable memory")]
    Capacity(usize),

    #[error("Cannot create backing memory object: {0}")]
    Backing(#[source] io::Error),

    #[error("Cannot resize backing memory object to {1} bytes: {0}")]
    Resize(#[source] io::Error, usize),

    #[error("Cannot reserve {1} bytes of address space: {0}")]
    Reserve(#[source] io::Error, usize),

    #[error("Cannot map first half of mirrored region: {0}")]
    MapFirst(#[source] io::Error),

    #[error("Cannot map second half of mirrored region: {0}")]
    MapSecond(#[source] io::Error),

    #[error("Cannot close backing memory object: {0}")]
    CloseBacking(#[source] io::Error),
}

/// Error returned when memory of a ring buffer could not be released.
///
/// Memory is considered released regardless, the region is unusable after this.
#[derive(Debug, Error)]
#[error("Cannot release ring buffer memory: {0}")]
pub struct TeardownError(#[from] pub io::Error);

/// Number of bytes a ring buffer of the given order holds.
///
/// Requested size is `2^order`, rounded up to a multiple of the host page size.
/// Since both of them are powers of 2, so is the result.
pub(crate) fn capacity_for(order: u32) -> Result<usize, ConstructionError> {
    let page_size = page_size::get();
    1usize
        .checked_shl(order)
        .and_then(|bytes| bytes.checked_next_multiple_of(page_size))
        // Mirrored regions need twice as much address space.
        .filter(|bytes| bytes.checked_mul(2).is_some_and(|len| len <= isize::MAX as usize))
        .ok_or(ConstructionError::Order(order))
}

/// Make sure a region of the given capacity can be reserved.
///
/// Capacity must be a power of 2, a multiple of page size, and twice of it
/// must still fit in addressable memory.
pub(crate) fn check_capacity(capacity: usize) -> Result<(), ConstructionError> {
    let valid = capacity.is_power_of_two()
        && capacity % page_size::get() == 0
        && capacity
            .checked_mul(2)
            .is_some_and(|len| len <= isize::MAX as usize);

    match valid {
        true => Ok(()),
        false => Err(ConstructionError::Capacity(capacity)),
    }
}

/// A fixed size block of byte addressable memory that backs a ring buffer.
///
/// The only thing a ring buffer needs from a region is a stable base address
/// and to know whether a span that crosses the end of the region continues at
/// the start of it (mirrored) or has to be split in two (not mirrored).
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// * [`Region::capacity`] is a power of 2 and never changes.
/// * [`Region::as_ptr`] is valid for reads and writes of `capacity` bytes, or
///   `2 * capacity` bytes when [`Region::MIRRORED`] is true, for the lifetime of the region.
/// * When mirrored, byte at `ptr + capacity + i` aliases byte at `ptr + i`.
/// * Memory is initialized (for instance zero filled) from the moment it is reserved.
pub unsafe trait Region: Sized {
    /// Whether any span of up to capacity bytes is contiguous in memory.
    const MIRRORED: bool;

    /// Reserve a region that can hold `capacity` bytes.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of bytes in the region, a power of 2 and a multiple of page size.
    /// * `populate` - Fault all pages so that they are eagerly initialized.
    ///
    /// Any other capacity is rejected with [`ConstructionError::Capacity`].
    fn reserve(capacity: usize, populate: bool) -> Result<Self, ConstructionError>;

    /// Number of bytes this region holds.
    fn capacity(&self) -> usize;

    /// Base address of the region.
    fn as_ptr(&self) -> *mut u8;

    /// Release memory held by this region, reporting failures.
    ///
    /// Dropping a region also releases memory, but silently.
    fn release(self) -> Result<(), TeardownError>;

    /// Number of bytes that can be addressed linearly starting at offset.
    ///
    /// # Arguments
    ///
    /// * `offset` - Physical offset into the region, < capacity.
    #[inline]
    fn contiguous(&self, offset: usize) -> usize {
        if Self::MIRRORED {
            self.capacity()
        } else {
            self.capacity() - offset
        }
    }

    /// Copy bytes into the region starting at offset, wrapping around the end.
    ///
    /// # Safety
    ///
    /// * offset < capacity.
    /// * src.len() <= capacity.
    /// * Nobody else accesses the destination bytes during the copy.
    ///
    /// # Arguments
    ///
    /// * `offset` - Physical offset to begin the copy at.
    /// * `src` - Bytes to copy.
    #[inline]
    unsafe fn copy_in(&self, offset: usize, src: &[u8]) {
        let (head, tail) = src.split_at(min(src.len(), self.contiguous(offset)));

        // Safety: Invariants of the trait and of this method.
        // Tail is always empty for mirrored regions.
        unsafe {
            let base = self.as_ptr();
            ptr::copy_nonoverlapping(head.as_ptr(), base.add(offset), head.len());
            ptr::copy_nonoverlapping(tail.as_ptr(), base, tail.len());
        }
    }

    /// Copy bytes out of the region starting at offset, wrapping around the end.
    ///
    /// # Safety
    ///
    /// * offset < capacity.
    /// * dst.len() <= capacity.
    /// * Nobody writes to the source bytes during the copy.
    ///
    /// # Arguments
    ///
    /// * `offset` - Physical offset to begin the copy at.
    /// * `dst` - Destination for copied bytes.
    #[inline]
    unsafe fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        let mid = min(dst.len(), self.contiguous(offset));
        let (head, tail) = dst.split_at_mut(mid);

        // Safety: Invariants of the trait and of this method.
        unsafe {
            let base = self.as_ptr();
            ptr::copy_nonoverlapping(base.add(offset), head.as_mut_ptr(), head.len());
            ptr::copy_nonoverlapping(base, tail.as_mut_ptr(), tail.len());
        }
    }
}

// Safety: Raw pointer is only dereferenced through the ring buffer cursors.
unsafe impl Send for SplitRegion {}
unsafe impl Sync for SplitRegion {}

/// Region of anonymous memory mapped exactly once.
///
/// Works on every platform [`memmap2`] supports. Transfers that cross the end of
/// the region are split into two copies, and zero-copy slices stop at the end.
#[derive(Debug)]
pub struct SplitRegion {
    ptr: *mut u8,
    mmap: MmapMut,
}

// Safety: Anonymous maps are page aligned, zero filled and live as long as the MmapMut.
unsafe impl Region for SplitRegion {
    const MIRRORED: bool = false;

    fn reserve(capacity: usize, populate: bool) -> Result<Self, ConstructionError> {
        check_capacity(capacity)?;

        let mut options = MmapOptions::new();
        options.len(capacity);
        if populate {
            options.populate();
        }

        let mut mmap = options
            .map_anon()
            .map_err(|error| ConstructionError::Reserve(error, capacity))?;

        // Moving the MmapMut around never moves the mapping itself.
        Ok(Self {
            ptr: mmap.as_mut_ptr(),
            mmap,
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn release(self) -> Result<(), TeardownError> {
        // memmap2 does not surface unmap errors.
        drop(self.mmap);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(12)]
    #[case(16)]
    #[case(20)]
    fn capacity_is_page_aligned_power_of_two(#[case] order: u32) {
        let capacity = capacity_for(order).expect("Order should be valid");
        assert!(capacity.is_power_of_two());
        assert_eq!(capacity % page_size::get(), 0);
        assert!(capacity >= 1 << order);
    }

    #[rstest]
    #[case(usize::BITS)]
    #[case(usize::BITS - 1)]
    #[case(u32::MAX)]
    fn capacity_rejects_huge_orders(#[case] order: u32) {
        match capacity_for(order) {
            Err(ConstructionError::Order(rejected)) => assert_eq!(rejected, order),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[rstest]
    #[case(0)]
    #[case(page_size::get() / 2)]
    #[case(page_size::get() * 3)]
    #[case(usize::MAX / 2 + 1)]
    #[case(usize::MAX)]
    fn split_rejects_invalid_capacity(#[case] capacity: usize) {
        match SplitRegion::reserve(capacity, false) {
            Err(ConstructionError::Capacity(rejected)) => assert_eq!(rejected, capacity),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    fn split_copy_wraps_around() -> Result<(), ConstructionError> {
        let capacity = capacity_for(0)?;
        let region = SplitRegion::reserve(capacity, false)?;
        assert_eq!(region.capacity(), capacity);
        assert_eq!(region.contiguous(capacity - 3), 3);

        // Copy five bytes across the end of the region.
        let src = [1, 2, 3, 4, 5];
        unsafe { region.copy_in(capacity - 3, &src) };

        let mut dst = [0; 5];
        unsafe { region.copy_out(capacity - 3, &mut dst) };
        assert_eq!(dst, src);

        // Last two bytes must have landed at the very beginning.
        let mut head = [0; 2];
        unsafe { region.copy_out(0, &mut head) };
        assert_eq!(head, [4, 5]);

        region.release().expect("Release should succeed");
        Ok(())
    }
}
