//! The set of arenas owned by one thread: a plain arena for leaf data
//! and a described arena for traceable/finalizable objects, a shared
//! page pool, and the growth accounting that drives collection
//! heuristics.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::arena::{Arena, LARGE_OBJECT_THRESHOLD, PagePool, SweepOutcome};
use crate::cache::AddressCaches;
use crate::header::{
    ALLOCATION_GRANULARITY, HeaderKind, HeaderRef, TypeDescriptor,
};
use crate::memory::round_up;
use crate::runtime::GcConfig;

#[derive(Debug)]
pub struct ThreadLocalHeap {
    plain: Arena,
    described: Arena,
    pool: PagePool,
    allocated_since_gc: usize,
    live_after_last_gc: usize,
}

impl ThreadLocalHeap {
    pub fn new(caches: Arc<AddressCaches>) -> ThreadLocalHeap {
        ThreadLocalHeap {
            plain: Arena::new(HeaderKind::Plain, caches.clone()),
            described: Arena::new(HeaderKind::Described, caches),
            pool: PagePool::new(),
            allocated_since_gc: 0,
            live_after_last_gc: 0,
        }
    }

    fn arena_for(&mut self, desc: Option<&'static TypeDescriptor>) -> &mut Arena {
        if desc.is_some() {
            &mut self.described
        } else {
            &mut self.plain
        }
    }

    /// Allocate `payload_size` zeroed bytes. A `Some` descriptor routes
    /// to the described arena (traceable, finalizable); `None` means a
    /// leaf object. Oversized requests take the large-object path
    /// automatically.
    pub fn allocate(
        &mut self,
        payload_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        let kind = if desc.is_some() {
            HeaderKind::Described
        } else {
            HeaderKind::Plain
        };
        let total =
            round_up(payload_size + kind.header_size(), ALLOCATION_GRANULARITY);
        self.allocated_since_gc += total;
        if total > LARGE_OBJECT_THRESHOLD {
            return self.arena_for(desc).allocate_large(payload_size, desc);
        }
        let arena = if desc.is_some() {
            &mut self.described
        } else {
            &mut self.plain
        };
        let object = arena.allocate(&mut self.pool, payload_size, desc);
        debug_assert!(self.contains(object.as_ptr() as usize));
        object
    }

    /// Explicit large-object allocation regardless of size.
    pub fn allocate_large(
        &mut self,
        payload_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        let kind = if desc.is_some() {
            HeaderKind::Described
        } else {
            HeaderKind::Plain
        };
        self.allocated_since_gc +=
            round_up(payload_size + kind.header_size(), ALLOCATION_GRANULARITY);
        self.arena_for(desc).allocate_large(payload_size, desc)
    }

    /// Cooperative trigger: live space grew by the configured ratio
    /// (at least the configured floor) since the last collection.
    pub fn should_gc(&self, config: &GcConfig) -> bool {
        let threshold = (config.heap_growth_ratio
            * self.live_after_last_gc as f64) as usize;
        self.allocated_since_gc >= threshold.max(config.heap_growth_min)
    }

    /// Immediate trigger bounding worst-case overshoot; runs with the
    /// stack treated as live.
    pub fn should_force_gc(&self, config: &GcConfig) -> bool {
        let threshold = (config.forced_growth_ratio
            * self.live_after_last_gc as f64) as usize;
        self.allocated_since_gc >= threshold.max(config.forced_growth_min)
    }

    pub fn make_consistent_for_gc(&mut self) {
        self.plain.make_consistent_for_gc();
        self.described.make_consistent_for_gc();
    }

    pub fn clear_marks(&mut self) {
        self.plain.clear_marks();
        self.described.clear_marks();
    }

    /// Sweep both arenas and reset the growth baseline.
    pub fn sweep(&mut self) -> SweepOutcome {
        let a = self.plain.sweep(&mut self.pool);
        let b = self.described.sweep(&mut self.pool);
        let outcome = SweepOutcome {
            live_bytes: a.live_bytes + b.live_bytes,
            swept_bytes: a.swept_bytes + b.swept_bytes,
            pages_pooled: a.pages_pooled + b.pages_pooled,
            large_released: a.large_released + b.large_released,
        };
        self.live_after_last_gc = outcome.live_bytes;
        self.allocated_since_gc = 0;
        outcome
    }

    pub fn find_header(&mut self, addr: usize) -> Option<HeaderRef> {
        self.plain
            .find_header(addr)
            .or_else(|| self.described.find_header(addr))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.plain.contains(addr) || self.described.contains(addr)
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.described.is_empty()
    }

    pub fn allocated_since_gc(&self) -> usize {
        self.allocated_since_gc
    }

    pub fn live_after_last_gc(&self) -> usize {
        self.live_after_last_gc
    }

    pub fn page_count(&self) -> usize {
        self.plain.page_count() + self.described.page_count()
    }

    pub fn pooled_pages(&self) -> usize {
        self.pool.len()
    }
}
