use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) | VmError::CommitFailed(e) | VmError::ReleaseFailed(e) => {
                Some(e)
            }
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
///
/// Backs direct (off-heap) arenas and huge unpooled regions.  Chunks are
/// committed in full at creation and released in full on destruction, so
/// there is no partial decommit path.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Chunk regions are committed in full right before first use;
                // ask for immediate physical backing to avoid a burst of minor
                // page faults on the allocation hot path.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
                };
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::*;
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                libc::VirtualAlloc(
                    std::ptr::null_mut(),
                    size,
                    libc::MEM_RESERVE,
                    libc::PAGE_NOACCESS,
                )
            };

            match NonNull::new(ptr as *mut u8) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::last_os_error())),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to VirtualAlloc.
            let result = unsafe {
                libc::VirtualAlloc(
                    ptr.as_ptr() as *mut libc::c_void,
                    size,
                    libc::MEM_COMMIT,
                    libc::PAGE_READWRITE,
                )
            };

            if result.is_null() {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // Windows VirtualFree with MEM_RELEASE must have size 0 and the base address of the region.
            // Safety: FFI call to VirtualFree.
            if unsafe { libc::VirtualFree(ptr.as_ptr() as *mut libc::c_void, 0, libc::MEM_RELEASE) }
                == 0
            {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
            // Safety: FFI call to GetSystemInfo.
            *PAGE_SIZE.get_or_init(|| unsafe {
                let mut info: libc::SYSTEM_INFO = std::mem::zeroed();
                libc::GetSystemInfo(&mut info);
                info.dwPageSize as usize
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed VmOps (no real mmap/VirtualAlloc)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead we back every "reservation"
// with a plain heap allocation (via `std::alloc`).
//
// `commit` is an intentional no-op: the memory is always accessible once
// reserved.  `release` frees the heap block.
//
// This is sufficient for testing the *synchronization* logic of the arenas
// (loom) and detecting undefined behaviour in unsafe pointer code (Miri);
// actual page-fault behaviour is tested by the real platform implementation
// in normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("Commit failed");

            // Write to memory
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            slice[size - 1] = 7;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[size - 1], 7);

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size() {
        // mmap with 0 size usually fails with EINVAL. We expect an error.
        // Safety: Test code.
        let result = unsafe { PlatformVmOps::reserve(0) };
        assert!(result.is_err(), "Reserving 0 bytes should fail");
    }

    #[test]
    fn test_commit_idempotent() {
        // Commit same range twice — should succeed without error
        let size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Reserve failed");

            PlatformVmOps::commit(ptr, size).expect("First commit failed");
            PlatformVmOps::commit(ptr, size).expect("Second commit failed (idempotency check)");

            *(ptr.as_ptr()) = 123;

            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformVmOps::page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "Page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_reservations() {
        // Multiple independent reserve/commit/release cycles — no interference
        let page_size = PlatformVmOps::page_size();
        // Safety: Test code.
        unsafe {
            let ptr1 = PlatformVmOps::reserve(page_size).expect("Reserve 1 failed");
            let ptr2 = PlatformVmOps::reserve(page_size).expect("Reserve 2 failed");

            assert_ne!(ptr1, ptr2);

            PlatformVmOps::commit(ptr1, page_size).expect("Commit 1 failed");
            PlatformVmOps::commit(ptr2, page_size).expect("Commit 2 failed");

            *(ptr1.as_ptr()) = 1;
            *(ptr2.as_ptr()) = 2;

            assert_eq!(*(ptr1.as_ptr()), 1);
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr1, page_size).expect("Release 1 failed");

            // ptr2 should still be valid
            assert_eq!(*(ptr2.as_ptr()), 2);

            PlatformVmOps::release(ptr2, page_size).expect("Release 2 failed");
        }
    }

    #[test]
    fn test_reserve_large_chunk_sized() {
        // A default-sized chunk reservation (16 MiB) must succeed on 64-bit.
        let size = 16 * 1024 * 1024;
        // Safety: Test code.
        unsafe {
            let ptr = PlatformVmOps::reserve(size).expect("Failed to reserve 16 MiB");
            PlatformVmOps::commit(ptr, size).expect("Commit failed");
            // Touch both ends.
            *(ptr.as_ptr()) = 0xAB;
            *(ptr.as_ptr().add(size - 1)) = 0xCD;
            PlatformVmOps::release(ptr, size).expect("Release failed");
        }
    }
}
