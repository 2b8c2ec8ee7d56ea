//! Small direct-mapped caches accelerating conservative word
//! resolution. One cache memoizes which thread's heap owns a recently
//! probed page, the other memoizes pages no heap owns. Purely an
//! accelerator: a flushed or cold cache only costs a full page walk,
//! never a wrong answer.

use parking_lot::Mutex;

use crate::memory::HEAP_PAGE_SIZE_LOG2;

const BUCKET_COUNT: usize = 64;
const WAYS: usize = 2;

#[derive(Debug, Copy, Clone)]
struct Entry {
    // Page key + 1; zero means the slot is empty.
    key: usize,
    value: usize,
}

const EMPTY: Entry = Entry { key: 0, value: 0 };

/// Page-granular memo keyed by `addr >> HEAP_PAGE_SIZE_LOG2`, two-way
/// associative; the newest entry in a bucket evicts the older one.
/// Each entry carries a caller-defined value (the owning thread for
/// the positive cache, unused for the negative one).
///
/// Both instances are flushed whenever any heap's page set changes and
/// at the start of every collection cycle.
#[derive(Debug)]
pub struct AddressCache {
    slots: [[Entry; WAYS]; BUCKET_COUNT],
}

#[inline]
fn page_key(addr: usize) -> usize {
    addr >> HEAP_PAGE_SIZE_LOG2
}

impl AddressCache {
    pub fn new() -> AddressCache {
        AddressCache {
            slots: [[EMPTY; WAYS]; BUCKET_COUNT],
        }
    }

    #[inline]
    fn bucket(key: usize) -> usize {
        key & (BUCKET_COUNT - 1)
    }

    /// The memoized value for the page holding `addr`, if present.
    pub fn lookup(&self, addr: usize) -> Option<usize> {
        let key = page_key(addr) + 1;
        let bucket = &self.slots[Self::bucket(key - 1)];
        bucket.iter().find(|e| e.key == key).map(|e| e.value)
    }

    /// Memoize `value` for the page holding `addr`.
    pub fn add(&mut self, addr: usize, value: usize) {
        let key = page_key(addr) + 1;
        let bucket = &mut self.slots[Self::bucket(key - 1)];
        if bucket[0].key == key {
            bucket[0].value = value;
            return;
        }
        bucket[1] = bucket[0];
        bucket[0] = Entry { key, value };
    }

    /// Forget everything; called whenever a page is added to or
    /// removed from the heap.
    pub fn flush(&mut self) {
        self.slots = [[EMPTY; WAYS]; BUCKET_COUNT];
    }
}

impl Default for AddressCache {
    fn default() -> Self {
        AddressCache::new()
    }
}

/// The process-wide pair of caches, shared between the runtime (which
/// consults them while marking) and every thread heap (which flushes
/// them when its page set changes).
#[derive(Debug, Default)]
pub struct AddressCaches {
    /// Page → owning thread, valid only within one stopped-world cycle.
    pub contains: Mutex<AddressCache>,
    /// Pages no heap owns; the stored value is unused.
    pub does_not_contain: Mutex<AddressCache>,
}

impl AddressCaches {
    pub fn new() -> AddressCaches {
        AddressCaches::default()
    }

    pub fn flush_all(&self) {
        self.contains.lock().flush();
        self.does_not_contain.lock().flush();
    }
}
