//! Definition of a region whose memory is mapped twice, back to back.

use crate::{ConstructionError, Region, TeardownError, check_capacity};
use std::{
    ffi::c_void,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd},
    ptr,
};

// Safety: Raw pointer is only dereferenced through the ring buffer cursors.
unsafe impl Send for MirroredRegion {}
unsafe impl Sync for MirroredRegion {}

/// Region where the same memory is visible twice, one copy right after the other.
///
/// ```text
/// base                 base + capacity        base + 2 * capacity
///  |---- mapping #1 -----|---- mapping #2 -----|
///            \                    /
///             `-- backing memory -'
/// ```
///
/// Any span of up to capacity bytes, starting at any offset < capacity, is a
/// single linear range of addresses. Writing past the end of the first mapping
/// writes to the beginning of the backing memory.
///
/// Backing memory is private to this process, nothing is ever shared by name.
#[derive(Debug)]
pub struct MirroredRegion {
    ptr: *mut u8,
    capacity: usize,
}

impl MirroredRegion {
    /// Unmap the whole mirrored range.
    ///
    /// Pointer is forgotten before unmapping, whatever the outcome.
    fn unmap(&mut self) -> io::Result<()> {
        let ptr = mem::replace(&mut self.ptr, ptr::null_mut());
        if ptr.is_null() {
            return Ok(());
        }

        // Safety: We exclusively own the range since it was reserved.
        match unsafe { libc::munmap(ptr.cast(), self.capacity * 2) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

// Safety: Both halves of the reservation alias the same zero filled backing object.
unsafe impl Region for MirroredRegion {
    const MIRRORED: bool = true;

    fn reserve(capacity: usize, populate: bool) -> Result<Self, ConstructionError> {
        check_capacity(capacity)?;

        // Address space for both mappings. Only used to find a stable base address.
        let reservation = Reservation::new(capacity * 2)?;

        // Memory that both mappings will alias.
        let backing = backing()?;
        // Safety: Descriptor is open for as long as backing is alive.
        if unsafe { libc::ftruncate(backing.as_raw_fd(), capacity as libc::off_t) } != 0 {
            let error = io::Error::last_os_error();
            return Err(ConstructionError::Resize(error, capacity));
        }

        // Safety: Both halves lie within the reservation we own.
        let first = reservation.ptr;
        let second = unsafe { first.cast::<u8>().add(capacity).cast::<c_void>() };

        map_fixed(first, capacity, &backing, populate).map_err(ConstructionError::MapFirst)?;
        map_fixed(second, capacity, &backing, populate).map_err(ConstructionError::MapSecond)?;

        // Mappings keep the backing object alive, descriptor is no longer needed.
        // Safety: Descriptor ownership is moved into close.
        if unsafe { libc::close(backing.into_raw_fd()) } != 0 {
            let error = io::Error::last_os_error();
            return Err(ConstructionError::CloseBacking(error));
        }

        Ok(Self {
            capacity,
            ptr: reservation.into_raw().cast(),
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn release(mut self) -> Result<(), TeardownError> {
        Ok(self.unmap()?)
    }
}

impl Drop for MirroredRegion {
    fn drop(&mut self) {
        if let Err(error) = self.unmap() {
            tracing::warn!(capacity = self.capacity, %error, "Cannot unmap mirrored region");
        }
    }
}

/// Inaccessible range of address space, unmapped on drop unless claimed.
struct Reservation {
    ptr: *mut c_void,
    len: usize,
}

impl Reservation {
    fn new(len: usize) -> Result<Self, ConstructionError> {
        // Safety: Kernel picks the address, nothing existing is replaced.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            return Err(ConstructionError::Reserve(error, len));
        }

        Ok(Self { ptr, len })
    }

    /// Claim the reservation, caller is now responsible for unmapping it.
    fn into_raw(self) -> *mut c_void {
        let ptr = self.ptr;
        mem::forget(self);
        ptr
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // Safety: Also removes any fixed mappings placed inside the range.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Map backing memory read/write over an address we already reserved.
fn map_fixed(addr: *mut c_void, len: usize, backing: &OwnedFd, populate: bool) -> io::Result<()> {
    let flags = libc::MAP_SHARED | libc::MAP_FIXED | populate_flag(populate);

    // Safety: Caller guarantees addr..addr+len is within a reservation it owns.
    let mapped = unsafe {
        libc::mmap(
            addr,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            backing.as_raw_fd(),
            0,
        )
    };

    if mapped == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    debug_assert_eq!(mapped, addr, "Fixed mapping placed at a different address");
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn populate_flag(populate: bool) -> libc::c_int {
    if populate { libc::MAP_POPULATE } else { 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn populate_flag(_populate: bool) -> libc::c_int {
    0
}

/// Anonymous memory object that can be mapped more than once.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn backing() -> Result<OwnedFd, ConstructionError> {
    // Safety: Name is a valid nul terminated string.
    let fd = unsafe { libc::memfd_create(c"mirrorbuf".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(ConstructionError::Backing(io::Error::last_os_error()));
    }

    // Safety: We just created this descriptor, nobody else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Anonymous memory object that can be mapped more than once.
///
/// Shared memory object is unlinked right after creation, so it only has
/// a name for as long as it takes to open it.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn backing() -> Result<OwnedFd, ConstructionError> {
    use std::{
        ffi::CString,
        sync::atomic::{AtomicUsize, Ordering},
    };

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let name = CString::new(format!("/mirrorbuf.{}.{id}", std::process::id()))
        .map_err(|error| ConstructionError::Backing(io::Error::other(error)))?;

    // Safety: Name is a valid nul terminated string.
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600,
        )
    };

    if fd < 0 {
        return Err(ConstructionError::Backing(io::Error::last_os_error()));
    }

    // Safety: We just created this descriptor, nobody else owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::shm_unlink(name.as_ptr()) } != 0 {
        return Err(ConstructionError::Backing(io::Error::last_os_error()));
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity_for;
    use rstest::rstest;

    #[rstest]
    #[case(0, false)]
    #[case(12, false)]
    #[case(16, true)]
    #[case(20, false)]
    fn halves_alias(#[case] order: u32, #[case] populate: bool) -> Result<(), ConstructionError> {
        let capacity = capacity_for(order)?;
        let region = MirroredRegion::reserve(capacity, populate)?;
        assert_eq!(region.capacity(), capacity);
        assert_eq!(region.contiguous(capacity - 1), capacity);

        // Raw pointers only, references to both halves would claim they don't alias.
        // Safety: Mirrored region is valid for 2 * capacity bytes.
        unsafe {
            let first = region.as_ptr();
            let second = first.add(capacity);

            // Memory is zero filled on reservation.
            assert!((0..capacity).all(|i| first.add(i).read_volatile() == 0));

            // Writes to the second half show up in the first.
            second.write_volatile(0xAB);
            second.add(capacity - 1).write_volatile(0xCD);
            assert_eq!(first.read_volatile(), 0xAB);
            assert_eq!(first.add(capacity - 1).read_volatile(), 0xCD);

            // And the other way around.
            first.add(capacity / 2).write_volatile(0xEF);
            assert_eq!(second.add(capacity / 2).read_volatile(), 0xEF);
        }

        region.release().expect("Release should succeed");
        Ok(())
    }

    #[rstest]
    #[case(0)]
    #[case(page_size::get() / 2)]
    #[case(page_size::get() * 3)]
    #[case(usize::MAX / 2 + 1)]
    #[case(usize::MAX)]
    fn rejects_invalid_capacity(#[case] capacity: usize) {
        match MirroredRegion::reserve(capacity, false) {
            Err(ConstructionError::Capacity(rejected)) => assert_eq!(rejected, capacity),
            other => panic!("Unexpected result: {other:?}"),
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn failed_reservation_releases_everything() -> Result<(), ConstructionError> {
        // Way more address space than any host can hand out.
        let huge = 1 << 60;
        for _ in 0..1024 {
            match MirroredRegion::reserve(huge, false) {
                Err(ConstructionError::Reserve(_, len)) => assert_eq!(len, huge * 2),
                other => panic!("Unexpected result: {other:?}"),
            }
        }

        // A leaked backing object or mapping per attempt would exhaust descriptors
        // or mappings long before this loop ends.
        let capacity = capacity_for(0)?;
        for _ in 0..4096 {
            match MirroredRegion::reserve(capacity / 2, false) {
                Err(ConstructionError::Capacity(_)) => {}
                other => panic!("Unexpected result: {other:?}"),
            }

            MirroredRegion::reserve(capacity, false)?
                .release()
                .expect("Release should succeed");
        }

        Ok(())
    }

    #[test]
    fn copy_across_end_is_linear() -> Result<(), ConstructionError> {
        let capacity = capacity_for(0)?;
        let region = MirroredRegion::reserve(capacity, false)?;

        let src: Vec<u8> = (0..64).collect();
        unsafe { region.copy_in(capacity - 32, &src) };

        // Tail of the copy landed at the start of the backing memory.
        let mut head = [0; 32];
        unsafe { region.copy_out(0, &mut head) };
        assert_eq!(&head, &src[32..]);

        let mut dst = vec![0; 64];
        unsafe { region.copy_out(capacity - 32, &mut dst) };
        assert_eq!(dst, src);
        Ok(())
    }

    #[test]
    fn drop_releases_memory() -> Result<(), ConstructionError> {
        // Mapping many large regions would exhaust address space if drop leaked them.
        let capacity = capacity_for(24)?;
        for _ in 0..64 {
            let region = MirroredRegion::reserve(capacity, false)?;
            drop(region);
        }
        Ok(())
    }
}
