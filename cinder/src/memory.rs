//! OS-backed memory for a single heap page (or one large object),
//! bracketed by guard pages and aligned to the heap page size so the
//! top bits of any interior address identify the page.

use std::ptr::NonNull;

use crate::system;

/// Log2 of the fixed heap page size. Every normal page payload is this
/// big and aligned to it.
pub const HEAP_PAGE_SIZE_LOG2: usize = 17;
/// Fixed heap page size: 128 KiB.
pub const HEAP_PAGE_SIZE: usize = 1 << HEAP_PAGE_SIZE_LOG2;

/// A reservation holding one writable payload with an inaccessible OS
/// page on each side. The payload starts aligned to [`HEAP_PAGE_SIZE`].
///
/// Dropping a `PageMemory` releases the whole reservation. A payload
/// can be repeatedly decommitted and recommitted while pooled.
#[derive(Debug)]
pub struct PageMemory {
    /// Base of the retained reservation (front guard page).
    base: NonNull<u8>,
    /// Length of the retained reservation, guards included.
    reserved: usize,
    writable: NonNull<u8>,
    payload_size: usize,
}

// SAFETY: PageMemory is an owned region; pooled pages move between a
// thread heap and its pool but are only ever touched by one thread at
// a time (or by the collector while that thread is parked).
unsafe impl Send for PageMemory {}

impl PageMemory {
    /// Reserve and commit memory for a payload of at least
    /// `payload_size` bytes.
    ///
    /// Reservation or commit failure is fatal: the collector has no
    /// smaller allocation to fall back to (process aborts).
    pub fn allocate(payload_size: usize) -> PageMemory {
        let guard = system::os_page_size();
        let payload = round_up(payload_size, guard);

        // Over-allocate by one heap page so an aligned payload start
        // always exists inside the reservation, then trim the slack
        // back to the OS.
        let excess = HEAP_PAGE_SIZE;
        let total = payload + 2 * guard + excess;
        let Some(base) = system::reserve(total) else {
            log::error!(
                "virtual memory exhausted reserving {total} bytes for a heap page"
            );
            std::process::abort();
        };

        let raw = base.as_ptr() as usize;
        let writable = round_up(raw + guard, HEAP_PAGE_SIZE);
        let keep_start = writable - guard;
        let keep_end = writable + payload + guard;

        // SAFETY: both trims are page-aligned sub-ranges of the fresh
        // reservation and nothing points into them.
        unsafe {
            if keep_start > raw {
                system::release(base, keep_start - raw);
            }
            let tail = (raw + total) - keep_end;
            if tail > 0 {
                let tail_ptr = NonNull::new_unchecked(keep_end as *mut u8);
                system::release(tail_ptr, tail);
            }
        }

        // SAFETY: keep_start/writable lie inside the retained range.
        let mem = unsafe {
            PageMemory {
                base: NonNull::new_unchecked(keep_start as *mut u8),
                reserved: keep_end - keep_start,
                writable: NonNull::new_unchecked(writable as *mut u8),
                payload_size: payload,
            }
        };
        if !mem.commit() {
            log::error!(
                "virtual memory exhausted committing {payload} payload bytes"
            );
            std::process::abort();
        }
        mem
    }

    /// Make the payload readable and writable again (pool reuse).
    #[must_use]
    pub fn commit(&self) -> bool {
        // SAFETY: payload range is inside our reservation
        unsafe { system::commit(self.writable, self.payload_size) }
    }

    /// Revoke access to the payload and advise the OS it is
    /// reclaimable, keeping the address range for later reuse.
    pub fn decommit(&self) {
        // SAFETY: payload range is inside our reservation and the
        // owning heap dropped every reference into it first.
        unsafe { system::decommit(self.writable, self.payload_size) }
    }

    #[inline]
    pub fn writable_start(&self) -> NonNull<u8> {
        self.writable
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Whether `addr` points into the writable payload.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.writable.as_ptr() as usize;
        addr >= start && addr < start + self.payload_size
    }
}

impl Drop for PageMemory {
    fn drop(&mut self) {
        // SAFETY: we own the reservation and no page/heap references
        // outlive the owning structure.
        unsafe { system::release(self.base, self.reserved) };
    }
}

#[inline]
pub const fn round_up(value: usize, to: usize) -> usize {
    (value + to - 1) & !(to - 1)
}
