//! Per-object metadata. Every managed object is prefixed by a header
//! carrying its total size (header included), a mark bit and a free
//! bit. Arenas are homogeneous in header kind: `Plain` headers are a
//! single word and describe leaf objects (no outgoing references, no
//! finalizer); `Described` headers carry a second word pointing at the
//! object's process-wide [`TypeDescriptor`].
//!
//! Reclaimed space is overlaid with free-list entries (size word plus
//! a link word) or, when too small to link, a bare free span header.

use std::ptr::NonNull;

use bitflags::bitflags;

use crate::visitor::{LivenessView, Visitor};

/// Allocation granularity in bytes; every header offset and object
/// size is a multiple of this.
pub const ALLOCATION_GRANULARITY: usize = 8;

/// Bytes needed to overlay a linked free-list entry.
pub const FREE_LIST_ENTRY_SIZE: usize = 16;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u64 {
        const FREE = 1 << 0;
        const MARK = 1 << 1;
    }
}

const FLAG_MASK: u64 = HeaderFlags::all().bits();

/// Enumerates the outgoing references of one object, field by field.
///
/// # Safety (for implementations)
/// `object` is the payload address of a live object of the descriptor's
/// type; the callback must only visit addresses that are themselves
/// managed object payloads.
pub type TraceFn = unsafe fn(&mut dyn Visitor, NonNull<u8>);

/// Releases non-memory resources of a dead object. Must not allocate
/// from the heap and must not stash `object` anywhere (no resurrection).
pub type FinalizeFn = unsafe fn(NonNull<u8>);

/// Runs after marking with final liveness visible; may clear weak
/// fields but cannot mark anything.
pub type WeakFn = unsafe fn(&mut LivenessView<'_>, NonNull<u8>);

/// One per managed type, process-wide and immutable.
#[derive(Debug)]
pub struct TypeDescriptor {
    pub trace: Option<TraceFn>,
    pub finalize: Option<FinalizeFn>,
    /// The type starts with a vtable pointer that may still be zero
    /// when a conservative scan observes the object mid-construction;
    /// such objects are marked but not traced.
    pub has_vtable: bool,
}

impl TypeDescriptor {
    pub const LEAF: TypeDescriptor = TypeDescriptor {
        trace: None,
        finalize: None,
        has_vtable: false,
    };
}

/// Which header layout an arena uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderKind {
    /// One word: `size | flags`.
    Plain,
    /// Two words: `size | flags`, then `&'static TypeDescriptor`.
    Described,
}

impl HeaderKind {
    #[inline]
    pub const fn header_size(self) -> usize {
        match self {
            HeaderKind::Plain => 8,
            HeaderKind::Described => 16,
        }
    }
}

/// A view of one header in page or large-object memory, polymorphic
/// over the header kind.
///
/// Holds a raw pointer; validity is the responsibility of whoever
/// resolved it (a page walk or an object address minus header size).
#[derive(Debug, Copy, Clone)]
pub struct HeaderRef {
    ptr: NonNull<u64>,
    kind: HeaderKind,
}

impl HeaderRef {
    /// # Safety
    /// `addr` must point at a header of kind `kind` inside committed
    /// heap memory, and stay valid for the life of this ref.
    #[inline]
    pub unsafe fn from_raw(addr: usize, kind: HeaderKind) -> HeaderRef {
        debug_assert!(addr % ALLOCATION_GRANULARITY == 0);
        // SAFETY: caller contract
        let ptr = unsafe { NonNull::new_unchecked(addr as *mut u64) };
        HeaderRef { ptr, kind }
    }

    /// Header of the object whose payload starts at `object`.
    ///
    /// # Safety
    /// `object` must be the payload address of an object allocated
    /// from an arena of kind `kind`.
    #[inline]
    pub unsafe fn for_object(object: NonNull<u8>, kind: HeaderKind) -> HeaderRef {
        let addr = object.as_ptr() as usize - kind.header_size();
        // SAFETY: the header immediately precedes the payload
        unsafe { HeaderRef::from_raw(addr, kind) }
    }

    #[inline]
    fn word(&self) -> u64 {
        // SAFETY: validity established at construction
        unsafe { self.ptr.as_ptr().read() }
    }

    #[inline]
    fn set_word(&self, word: u64) {
        // SAFETY: validity established at construction
        unsafe { self.ptr.as_ptr().write(word) }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Total size including the header. Never zero for an initialized
    /// header.
    #[inline]
    pub fn size(&self) -> usize {
        (self.word() & !FLAG_MASK) as usize
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.word() & HeaderFlags::FREE.bits() != 0
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.word() & HeaderFlags::MARK.bits() != 0
    }

    #[inline]
    pub fn mark(&self) {
        debug_assert!(!self.is_free(), "marking a free header");
        self.set_word(self.word() | HeaderFlags::MARK.bits());
    }

    #[inline]
    pub fn unmark(&self) {
        self.set_word(self.word() & !HeaderFlags::MARK.bits());
    }

    /// Write a live-object header. `size` includes the header itself.
    pub fn init_object(&self, size: usize, desc: Option<&'static TypeDescriptor>) {
        debug_assert!(size >= self.kind.header_size());
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        self.set_word(size as u64);
        match self.kind {
            HeaderKind::Plain => debug_assert!(desc.is_none()),
            HeaderKind::Described => {
                let desc = desc.expect("described arenas require a descriptor");
                // SAFETY: second header word exists for Described kind
                unsafe {
                    self.ptr
                        .as_ptr()
                        .add(1)
                        .write(desc as *const TypeDescriptor as u64);
                }
            }
        }
    }

    /// Overwrite with a free span: reclaimed space that is not linked
    /// into any bucket (either too small or folded for consistency).
    pub fn init_free_span(&self, size: usize) {
        debug_assert!(size >= ALLOCATION_GRANULARITY);
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        self.set_word(size as u64 | HeaderFlags::FREE.bits());
    }

    /// The descriptor of a live described object.
    pub fn descriptor(&self) -> Option<&'static TypeDescriptor> {
        if self.kind == HeaderKind::Plain || self.is_free() {
            return None;
        }
        // SAFETY: described live headers store a &'static descriptor
        // in their second word.
        unsafe {
            let raw = self.ptr.as_ptr().add(1).read() as *const TypeDescriptor;
            Some(&*raw)
        }
    }

    /// Payload address of the object this header prefixes.
    #[inline]
    pub fn object_address(&self) -> NonNull<u8> {
        // SAFETY: payload follows the header by construction
        unsafe {
            NonNull::new_unchecked(
                (self.address() + self.kind.header_size()) as *mut u8,
            )
        }
    }

    /// Payload size (total minus header).
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.size() - self.kind.header_size()
    }

    /// Run the finalizer, if the object declared one.
    ///
    /// # Safety
    /// Must run at most once per object, on the arena's owning thread,
    /// after the object is known dead.
    pub unsafe fn finalize(&self) {
        if let Some(desc) = self.descriptor()
            && let Some(finalize) = desc.finalize
        {
            // SAFETY: caller contract
            unsafe { finalize(self.object_address()) };
        }
    }
}

/// Free-list entry accessors. An entry overlays the first
/// [`FREE_LIST_ENTRY_SIZE`] bytes of a reclaimed run: the size word
/// (with the free bit) followed by the absolute address of the next
/// entry in the same bucket, zero-terminated.
pub mod free_entry {
    use super::*;

    /// # Safety
    /// `addr..addr + size` must be reclaimed space inside one page,
    /// with `size >= FREE_LIST_ENTRY_SIZE`.
    pub unsafe fn write(addr: usize, size: usize, next: usize) {
        debug_assert!(size >= FREE_LIST_ENTRY_SIZE);
        // SAFETY: caller contract
        unsafe {
            let p = addr as *mut u64;
            p.write(size as u64 | HeaderFlags::FREE.bits());
            p.add(1).write(next as u64);
        }
    }

    /// # Safety
    /// `addr` must hold a linked free entry.
    pub unsafe fn next(addr: usize) -> usize {
        // SAFETY: caller contract
        unsafe { (addr as *const u64).add(1).read() as usize }
    }

    /// # Safety
    /// `addr` must hold a free header (entry or span).
    pub unsafe fn size(addr: usize) -> usize {
        // SAFETY: caller contract
        unsafe { ((addr as *const u64).read() & !FLAG_MASK) as usize }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scratch() -> Box<[u64; 8]> {
        Box::new([0u64; 8])
    }

    #[test]
    fn plain_header_roundtrips_size_and_bits() {
        let mut buf = scratch();
        let addr = buf.as_mut_ptr() as usize;
        // SAFETY: points at owned scratch memory
        let h = unsafe { HeaderRef::from_raw(addr, HeaderKind::Plain) };
        h.init_object(40, None);
        assert_eq!(h.size(), 40);
        assert_eq!(h.payload_size(), 32);
        assert!(!h.is_free());
        assert!(!h.is_marked());
        h.mark();
        assert!(h.is_marked());
        assert_eq!(h.size(), 40, "mark bit must not disturb the size");
        h.unmark();
        assert!(!h.is_marked());
    }

    #[test]
    fn described_header_stores_descriptor() {
        static DESC: TypeDescriptor = TypeDescriptor::LEAF;
        let mut buf = scratch();
        let addr = buf.as_mut_ptr() as usize;
        // SAFETY: points at owned scratch memory
        let h = unsafe { HeaderRef::from_raw(addr, HeaderKind::Described) };
        h.init_object(48, Some(&DESC));
        let got = h.descriptor().expect("live described header has one");
        assert!(std::ptr::eq(got, &DESC));
        assert_eq!(h.object_address().as_ptr() as usize, addr + 16);
    }

    #[test]
    fn free_span_reports_free_and_no_descriptor() {
        let mut buf = scratch();
        let addr = buf.as_mut_ptr() as usize;
        // SAFETY: points at owned scratch memory
        let h = unsafe { HeaderRef::from_raw(addr, HeaderKind::Described) };
        h.init_free_span(24);
        assert!(h.is_free());
        assert_eq!(h.size(), 24);
        assert!(h.descriptor().is_none());
    }

    #[test]
    fn free_entry_links_chain() {
        let mut a = scratch();
        let mut b = scratch();
        let pa = a.as_mut_ptr() as usize;
        let pb = b.as_mut_ptr() as usize;
        // SAFETY: owned scratch buffers, entry-sized
        unsafe {
            free_entry::write(pb, 32, 0);
            free_entry::write(pa, 16, pb);
            assert_eq!(free_entry::next(pa), pb);
            assert_eq!(free_entry::next(pb), 0);
            assert_eq!(free_entry::size(pa), 16);
            assert_eq!(free_entry::size(pb), 32);
        }
        // The entry must read back as a free header too.
        // SAFETY: same scratch buffer
        let h = unsafe { HeaderRef::from_raw(pa, HeaderKind::Plain) };
        assert!(h.is_free());
    }

    #[test]
    fn finalize_dispatches_through_descriptor() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn fin(_obj: NonNull<u8>) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }
        static DESC: TypeDescriptor = TypeDescriptor {
            trace: None,
            finalize: Some(fin),
            has_vtable: false,
        };
        let mut buf = scratch();
        let addr = buf.as_mut_ptr() as usize;
        // SAFETY: owned scratch memory
        let h = unsafe { HeaderRef::from_raw(addr, HeaderKind::Described) };
        h.init_object(32, Some(&DESC));
        // SAFETY: test object is "dead" scratch space
        unsafe { h.finalize() };
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
