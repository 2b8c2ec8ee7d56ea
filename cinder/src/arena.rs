//! Thread-private object space: fixed-size pages tiled edge to edge
//! with headers, segregated free lists, a bump allocation point, a
//! separate path for oversized objects, and the sweep that turns dead
//! objects back into free-list space.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::cache::AddressCaches;
use crate::header::{
    ALLOCATION_GRANULARITY, FREE_LIST_ENTRY_SIZE, HeaderKind, HeaderRef,
    TypeDescriptor, free_entry,
};
use crate::memory::{HEAP_PAGE_SIZE, HEAP_PAGE_SIZE_LOG2, PageMemory, round_up};

/// Requests above this go to the large-object path.
pub const LARGE_OBJECT_THRESHOLD: usize = HEAP_PAGE_SIZE / 2;

const FREE_LIST_BUCKETS: usize = HEAP_PAGE_SIZE_LOG2 + 1;

/// One fixed-size page. The payload is tiled by consecutive headers:
/// walking from offset zero by each header's size lands exactly on the
/// payload end. The page carries a lazily built bitmap of header
/// starts for interior-pointer resolution.
#[derive(Debug)]
pub struct Page {
    memory: PageMemory,
    kind: HeaderKind,
    object_start_bitmap: Option<Box<[u8]>>,
    next: Option<Box<Page>>,
}

impl Page {
    fn new(memory: PageMemory, kind: HeaderKind) -> Box<Page> {
        Box::new(Page {
            memory,
            kind,
            object_start_bitmap: None,
            next: None,
        })
    }

    #[inline]
    pub fn payload_start(&self) -> usize {
        self.memory.writable_start().as_ptr() as usize
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.memory.payload_size()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.memory.contains(addr)
    }

    /// Bounds-checked header access by payload offset.
    pub fn header_at(&self, offset: usize) -> HeaderRef {
        assert!(offset < self.payload_size(), "header offset out of page");
        assert!(offset % ALLOCATION_GRANULARITY == 0);
        // SAFETY: offset checked against the committed payload
        unsafe {
            HeaderRef::from_raw(self.payload_start() + offset, self.kind)
        }
    }

    /// Assert the tiling invariant: header sizes sum exactly to the
    /// payload end. Only meaningful while the page is consistent (no
    /// open bump region).
    pub fn verify_tiling(&self) {
        let mut offset = 0;
        while offset < self.payload_size() {
            let h = self.header_at(offset);
            let size = h.size();
            assert!(size > 0, "zero-sized header at offset {offset}");
            assert!(
                offset + size <= self.payload_size(),
                "header at {offset} overruns the page"
            );
            offset += size;
        }
        assert_eq!(offset, self.payload_size(), "tiling gap before page end");
    }

    fn build_object_start_bitmap(&mut self) {
        let granules = self.payload_size() / ALLOCATION_GRANULARITY;
        let mut bits = vec![0u8; granules.div_ceil(8)].into_boxed_slice();
        let mut offset = 0;
        while offset < self.payload_size() {
            let granule = offset / ALLOCATION_GRANULARITY;
            bits[granule / 8] |= 1 << (granule % 8);
            let size = self.header_at(offset).size();
            debug_assert!(size > 0);
            offset += size;
        }
        self.object_start_bitmap = Some(bits);
    }

    fn clear_object_start_bitmap(&mut self) {
        self.object_start_bitmap = None;
    }

    /// Resolve an arbitrary interior address to the live object header
    /// that owns it, if any. Builds the bitmap on first use.
    pub fn find_header(&mut self, addr: usize) -> Option<HeaderRef> {
        debug_assert!(self.contains(addr));
        if self.object_start_bitmap.is_none() {
            self.build_object_start_bitmap();
        }
        let bits = self.object_start_bitmap.as_ref().expect("just built");
        let mut granule = (addr - self.payload_start()) / ALLOCATION_GRANULARITY;
        loop {
            if bits[granule / 8] & (1 << (granule % 8)) != 0 {
                break;
            }
            debug_assert!(granule > 0, "offset zero always starts a header");
            granule -= 1;
        }
        let offset = granule * ALLOCATION_GRANULARITY;
        let header = self.header_at(offset);
        if header.is_free() {
            return None;
        }
        if addr >= self.payload_start() + offset + header.size() {
            return None;
        }
        Some(header)
    }

    /// First pass of sweeping: finalize every dead object, report live
    /// bytes. Headers are left intact for the second pass.
    fn finalize_dead(&self) -> usize {
        let mut offset = 0;
        let mut live = 0;
        while offset < self.payload_size() {
            let h = self.header_at(offset);
            let size = h.size();
            if h.is_marked() {
                live += size;
            } else if !h.is_free() {
                // SAFETY: unmarked after a completed trace means dead;
                // we run on the owning thread, once.
                unsafe { h.finalize() };
            }
            offset += size;
        }
        live
    }

    /// Second pass: coalesce every non-marked run into the free list
    /// and clear mark bits on survivors.
    fn rebuild_free_space(&self, free: &mut FreeList) {
        let mut offset = 0;
        let mut gap_start: Option<usize> = None;
        while offset < self.payload_size() {
            let h = self.header_at(offset);
            let size = h.size();
            if h.is_marked() {
                if let Some(start) = gap_start.take() {
                    free.add(self.payload_start() + start, offset - start);
                }
                h.unmark();
            } else {
                gap_start.get_or_insert(offset);
            }
            offset += size;
        }
        if let Some(start) = gap_start {
            free.add(
                self.payload_start() + start,
                self.payload_size() - start,
            );
        }
    }
}

/// A single object on its own dedicated reservation; marked and swept
/// like page objects, never split or reused.
#[derive(Debug)]
pub struct LargeObject {
    memory: PageMemory,
    kind: HeaderKind,
}

impl LargeObject {
    #[inline]
    pub fn header(&self) -> HeaderRef {
        // SAFETY: the header sits at the start of the committed payload
        unsafe {
            HeaderRef::from_raw(
                self.memory.writable_start().as_ptr() as usize,
                self.kind,
            )
        }
    }

    /// Whether `addr` falls inside the header-plus-object span.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.memory.writable_start().as_ptr() as usize;
        addr >= start && addr < start + self.header().size()
    }
}

/// Segregated free lists bucketed by `floor(log2(size))`, with the
/// index of the biggest non-empty bucket as a search hint. Entry links
/// live inside the reclaimed page space itself.
#[derive(Debug)]
pub struct FreeList {
    buckets: [usize; FREE_LIST_BUCKETS],
    biggest: usize,
}

#[inline]
fn bucket_index(size: usize) -> usize {
    debug_assert!(size >= ALLOCATION_GRANULARITY);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

impl FreeList {
    fn new() -> FreeList {
        FreeList {
            buckets: [0; FREE_LIST_BUCKETS],
            biggest: 0,
        }
    }

    /// Record `size` reclaimed bytes at `addr`. Runs smaller than a
    /// linkable entry become unlinked free spans: still walkable, not
    /// allocatable until a later sweep coalesces them.
    pub fn add(&mut self, addr: usize, size: usize) {
        debug_assert!(size >= ALLOCATION_GRANULARITY);
        if size < FREE_LIST_ENTRY_SIZE {
            // SAFETY: addr/size describe reclaimed space in a live page
            unsafe {
                HeaderRef::from_raw(addr, HeaderKind::Plain)
                    .init_free_span(size)
            };
            return;
        }
        let bucket = bucket_index(size);
        debug_assert!(bucket < FREE_LIST_BUCKETS);
        // SAFETY: addr/size describe reclaimed space in a live page
        unsafe { free_entry::write(addr, size, self.buckets[bucket]) };
        self.buckets[bucket] = addr;
        if bucket > self.biggest {
            self.biggest = bucket;
        }
    }

    /// Take an entry of at least `alloc_size` bytes, searching from
    /// the biggest bucket that can satisfy the request downwards.
    pub fn take(&mut self, alloc_size: usize) -> Option<(usize, usize)> {
        let min_bucket = bucket_index(alloc_size);
        if min_bucket > self.biggest {
            return None;
        }
        for bucket in (min_bucket..=self.biggest).rev() {
            // Any entry in a bucket above the minimum is big enough;
            // within the minimum bucket sizes vary, so walk the chain.
            let mut prev = 0usize;
            let mut entry = self.buckets[bucket];
            while entry != 0 {
                // SAFETY: chained entries were written by add()
                let (size, next) = unsafe {
                    (free_entry::size(entry), free_entry::next(entry))
                };
                if size >= alloc_size {
                    if prev == 0 {
                        self.buckets[bucket] = next;
                    } else {
                        // SAFETY: prev is the entry we just walked over
                        unsafe { free_entry::write(prev, free_entry::size(prev), next) };
                    }
                    self.shrink_biggest();
                    return Some((entry, size));
                }
                prev = entry;
                entry = next;
            }
        }
        None
    }

    fn shrink_biggest(&mut self) {
        while self.biggest > 0 && self.buckets[self.biggest] == 0 {
            self.biggest -= 1;
        }
    }

    /// Drop every bucket. The entries remain in page memory as free
    /// headers, so walks stay consistent; sweeping rebuilds the lists.
    pub fn clear(&mut self) {
        self.buckets = [0; FREE_LIST_BUCKETS];
        self.biggest = 0;
    }

    #[cfg(test)]
    fn bucket_head(&self, index: usize) -> usize {
        self.buckets[index]
    }
}

/// Decommitted-but-reserved pages kept for reuse, avoiding repeated
/// OS map/unmap traffic.
#[derive(Debug, Default)]
pub struct PagePool {
    pages: Vec<PageMemory>,
}

impl PagePool {
    pub fn new() -> PagePool {
        PagePool { pages: Vec::new() }
    }

    pub fn take(&mut self) -> Option<PageMemory> {
        let memory = self.pages.pop()?;
        if !memory.commit() {
            log::error!("virtual memory exhausted recommitting a pooled page");
            std::process::abort();
        }
        Some(memory)
    }

    pub fn give(&mut self, memory: PageMemory) {
        memory.decommit();
        self.pages.push(memory);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }
}

/// What a sweep reclaimed and what survived, for heuristics and logs.
#[derive(Debug, Default, Copy, Clone)]
pub struct SweepOutcome {
    pub live_bytes: usize,
    pub swept_bytes: usize,
    pub pages_pooled: usize,
    pub large_released: usize,
}

/// A pool of pages homogeneous in header kind, plus its large objects,
/// free lists and bump allocation point.
#[derive(Debug)]
pub struct Arena {
    kind: HeaderKind,
    pages: Option<Box<Page>>,
    page_count: usize,
    large_objects: Vec<LargeObject>,
    free_list: FreeList,
    bump_addr: usize,
    bump_remaining: usize,
    caches: Arc<AddressCaches>,
}

impl Arena {
    pub fn new(kind: HeaderKind, caches: Arc<AddressCaches>) -> Arena {
        Arena {
            kind,
            pages: None,
            page_count: 0,
            large_objects: Vec::new(),
            free_list: FreeList::new(),
            bump_addr: 0,
            bump_remaining: 0,
            caches,
        }
    }

    fn total_size(&self, payload_size: usize) -> usize {
        round_up(payload_size + self.kind.header_size(), ALLOCATION_GRANULARITY)
    }

    /// In-arena allocation. Fast path bumps; the slow path retires the
    /// bump remainder, consults the free lists, then takes a pooled or
    /// fresh page and retries once.
    pub fn allocate(
        &mut self,
        pool: &mut PagePool,
        payload_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        assert!(payload_size > 0, "zero-sized allocation");
        let alloc_size = self.total_size(payload_size);
        debug_assert!(
            alloc_size <= LARGE_OBJECT_THRESHOLD,
            "oversized request routed into an arena"
        );
        if self.bump_remaining < alloc_size {
            self.ensure_allocation_point(pool, alloc_size);
        }
        self.carve(alloc_size, desc)
    }

    fn ensure_allocation_point(&mut self, pool: &mut PagePool, alloc_size: usize) {
        self.retire_allocation_point();
        if let Some((addr, size)) = self.free_list.take(alloc_size) {
            self.bump_addr = addr;
            self.bump_remaining = size;
            return;
        }
        let memory = pool
            .take()
            .unwrap_or_else(|| PageMemory::allocate(HEAP_PAGE_SIZE));
        self.bump_addr = memory.writable_start().as_ptr() as usize;
        self.bump_remaining = memory.payload_size();
        let mut page = Page::new(memory, self.kind);
        page.next = self.pages.take();
        self.pages = Some(page);
        self.page_count += 1;
        self.caches.flush_all();
        // A fresh page always satisfies any in-arena request.
        assert!(
            self.bump_remaining >= alloc_size,
            "free-list and page allocation both failed to satisfy {alloc_size}"
        );
    }

    /// Fold the current bump remainder back into the free lists so it
    /// is no longer "checked out".
    fn retire_allocation_point(&mut self) {
        if self.bump_remaining > 0 {
            self.free_list.add(self.bump_addr, self.bump_remaining);
        }
        self.bump_addr = 0;
        self.bump_remaining = 0;
    }

    fn carve(
        &mut self,
        alloc_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        debug_assert!(self.bump_remaining >= alloc_size);
        let addr = self.bump_addr;
        self.bump_addr += alloc_size;
        self.bump_remaining -= alloc_size;
        // SAFETY: addr points at committed page space we just reserved
        let header = unsafe { HeaderRef::from_raw(addr, self.kind) };
        header.init_object(alloc_size, desc);
        let object = header.object_address();
        // Reused free-list space carries stale bytes; the contract is
        // zero-initialized payloads.
        // SAFETY: payload span belongs to this allocation
        unsafe {
            object.as_ptr().write_bytes(0, header.payload_size());
        }
        object
    }

    /// Dedicated-reservation path for oversized objects.
    pub fn allocate_large(
        &mut self,
        payload_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        assert!(payload_size > 0, "zero-sized allocation");
        let alloc_size = self.total_size(payload_size);
        let memory = PageMemory::allocate(alloc_size);
        // SAFETY: header goes at the start of the fresh payload
        let header = unsafe {
            HeaderRef::from_raw(memory.writable_start().as_ptr() as usize, self.kind)
        };
        header.init_object(alloc_size, desc);
        let object = header.object_address();
        self.large_objects.push(LargeObject {
            memory,
            kind: self.kind,
        });
        self.caches.flush_all();
        object
    }

    /// Fold the bump point away, drop the free-list buckets and any
    /// cached object-start bitmaps: afterwards every byte of every
    /// page is visible to a header walk.
    pub fn make_consistent_for_gc(&mut self) {
        self.retire_allocation_point();
        self.free_list.clear();
        let mut page = self.pages.as_deref_mut();
        while let Some(p) = page {
            p.clear_object_start_bitmap();
            page = p.next.as_deref_mut();
        }
    }

    /// Clear every mark bit. Runs before each trace so a cycle never
    /// inherits marks from a sweep that has not happened yet.
    pub fn clear_marks(&mut self) {
        let mut page = self.pages.as_deref();
        while let Some(p) = page {
            let mut offset = 0;
            while offset < p.payload_size() {
                let h = p.header_at(offset);
                if !h.is_free() {
                    h.unmark();
                }
                offset += h.size();
            }
            page = p.next.as_deref();
        }
        for large in &self.large_objects {
            large.header().unmark();
        }
    }

    /// One linear pass per page: finalize dead objects, refill the
    /// free lists, return completely empty pages to the pool rather
    /// than sweeping them object by object.
    pub fn sweep(&mut self, pool: &mut PagePool) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut pages_changed = false;

        let mut old = self.pages.take();
        while let Some(mut page) = old {
            old = page.next.take();
            let live = page.finalize_dead();
            if live == 0 {
                pool.give(page.memory);
                self.page_count -= 1;
                outcome.pages_pooled += 1;
                outcome.swept_bytes += HEAP_PAGE_SIZE;
                pages_changed = true;
            } else {
                page.rebuild_free_space(&mut self.free_list);
                page.clear_object_start_bitmap();
                outcome.live_bytes += live;
                outcome.swept_bytes += page.payload_size() - live;
                if cfg!(debug_assertions) {
                    page.verify_tiling();
                }
                page.next = self.pages.take();
                self.pages = Some(page);
            }
        }

        self.large_objects.retain(|large| {
            let header = large.header();
            if header.is_marked() {
                header.unmark();
                outcome.live_bytes += header.size();
                true
            } else {
                // SAFETY: dead after a completed trace, owner thread
                unsafe { header.finalize() };
                outcome.swept_bytes += header.size();
                outcome.large_released += 1;
                pages_changed = true;
                false
            }
        });

        if pages_changed {
            self.caches.flush_all();
        }
        outcome
    }

    /// Resolve a candidate address to the header owning it, if any.
    pub fn find_header(&mut self, addr: usize) -> Option<HeaderRef> {
        let mut page = self.pages.as_deref_mut();
        while let Some(p) = page {
            if p.contains(addr) {
                return p.find_header(addr);
            }
            page = p.next.as_deref_mut();
        }
        for large in &self.large_objects {
            if large.contains(addr) {
                let header = large.header();
                if !header.is_free() {
                    return Some(header);
                }
                return None;
            }
        }
        None
    }

    /// Whether any page or large object contains `addr`.
    pub fn contains(&self, addr: usize) -> bool {
        let mut page = self.pages.as_deref();
        while let Some(p) = page {
            if p.contains(addr) {
                return true;
            }
            page = p.next.as_deref();
        }
        self.large_objects.iter().any(|l| l.contains(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_none()
            && self.large_objects.is_empty()
            && self.bump_remaining == 0
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    #[cfg(test)]
    pub fn first_page(&self) -> Option<&Page> {
        self.pages.as_deref()
    }
}
