//! Thin wrappers over the OS virtual-memory and thread introspection
//! primitives the collector needs. Everything here is unix-only; the
//! rest of the crate goes through these functions and never calls
//! `libc` directly.

use std::ffi::c_void;
use std::ptr::NonNull;

/// Reserve `len` bytes of address space with no access rights.
///
/// Returns `None` on exhaustion; callers treat that as fatal.
pub fn reserve(len: usize) -> Option<NonNull<u8>> {
    // SAFETY: anonymous private mapping, no file descriptor involved.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr.cast::<u8>())
}

/// Release a region previously obtained from [`reserve`] (or a
/// still-reserved sub-range of one, page aligned).
///
/// # Safety
/// `ptr..ptr + len` must be a page-aligned range owned by the caller
/// with no live references into it.
pub unsafe fn release(ptr: NonNull<u8>, len: usize) {
    // SAFETY: caller contract
    let rc = unsafe { libc::munmap(ptr.as_ptr().cast::<c_void>(), len) };
    debug_assert_eq!(rc, 0, "munmap of an owned range cannot fail");
}

/// Make a reserved range readable and writable.
///
/// Fails closed: a `false` return leaves the range inaccessible.
///
/// # Safety
/// `ptr..ptr + len` must lie inside a reservation owned by the caller.
pub unsafe fn commit(ptr: NonNull<u8>, len: usize) -> bool {
    // SAFETY: caller contract
    let rc = unsafe {
        libc::mprotect(
            ptr.as_ptr().cast::<c_void>(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    rc == 0
}

/// Drop access to a committed range and tell the OS its contents are
/// disposable, without giving up the address range itself.
///
/// # Safety
/// `ptr..ptr + len` must be a committed range owned by the caller with
/// no live references into it.
pub unsafe fn decommit(ptr: NonNull<u8>, len: usize) {
    // SAFETY: caller contract
    unsafe {
        libc::madvise(ptr.as_ptr().cast::<c_void>(), len, libc::MADV_DONTNEED);
        let rc =
            libc::mprotect(ptr.as_ptr().cast::<c_void>(), len, libc::PROT_NONE);
        debug_assert_eq!(rc, 0, "revoking access cannot fail");
    }
}

/// Size of an OS page (guard regions are sized in these).
pub fn os_page_size() -> usize {
    // SAFETY: trivially safe sysconf query
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(sz > 0);
    sz as usize
}

/// The current thread's stack as `(lowest, highest)` addresses.
///
/// The highest address is where conservative scans of this thread end;
/// a scan never has to look above it.
#[cfg(target_os = "linux")]
pub fn thread_stack_bounds() -> (usize, usize) {
    // SAFETY: attr is fully initialized by pthread_getattr_np before use
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        assert_eq!(rc, 0, "querying own thread attributes cannot fail");
        let mut base: *mut c_void = std::ptr::null_mut();
        let mut size: usize = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut base, &mut size);
        assert_eq!(rc, 0, "querying own stack bounds cannot fail");
        libc::pthread_attr_destroy(&mut attr);
        let lo = base as usize;
        (lo, lo + size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn thread_stack_bounds() -> (usize, usize) {
    // Fallback: treat the caller's frame as the top of stack. Good
    // enough for the tests that run on non-linux hosts.
    let top = approximate_stack_pointer();
    (top.saturating_sub(8 * 1024 * 1024), top)
}

/// An address inside the current stack frame, used as the low end of a
/// conservative scan. Deliberately `inline(never)` so the value really
/// is below every caller frame.
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker as *const u8 as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_write_release() {
        let len = os_page_size() * 4;
        let ptr = reserve(len).expect("reservation of a few pages works");
        // SAFETY: freshly reserved range
        assert!(unsafe { commit(ptr, len) }, "commit must succeed");
        // SAFETY: just committed read/write
        unsafe {
            ptr.as_ptr().write(0xAB);
            assert_eq!(ptr.as_ptr().read(), 0xAB);
        }
        // SAFETY: our range, no references left
        unsafe { release(ptr, len) };
    }

    #[test]
    fn decommit_keeps_the_range_reusable() {
        let len = os_page_size() * 2;
        let ptr = reserve(len).expect("reservation works");
        // SAFETY: freshly reserved
        unsafe {
            assert!(commit(ptr, len));
            ptr.as_ptr().write(7);
            decommit(ptr, len);
            // The range is still ours; committing again must work and
            // the contents must have been discarded.
            assert!(commit(ptr, len));
            assert_eq!(
                ptr.as_ptr().read(),
                0,
                "decommitted page reads as zero"
            );
            release(ptr, len);
        }
    }

    #[test]
    fn stack_bounds_contain_a_local() {
        let (lo, hi) = thread_stack_bounds();
        let here = approximate_stack_pointer();
        assert!(lo < hi);
        assert!(
            here > lo && here < hi,
            "a stack local must sit inside the reported bounds"
        );
    }
}
