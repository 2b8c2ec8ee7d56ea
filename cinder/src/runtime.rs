//! Process-wide collector state shared by every attached thread: the
//! configuration, the thread registry, the safe point barrier, the
//! persistent root set and aggregate statistics.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::arena::SweepOutcome;
use crate::barrier::SafePointBarrier;
use crate::cache::AddressCaches;
use crate::gc::GcStats;
use crate::header::TypeDescriptor;
use crate::threads::ThreadState;
use crate::visitor::Visitor;

/// Collection tuning. The defaults follow the usual stop-the-world
/// heuristics: request a collection once the heap grew by half of the
/// surviving size (at least 512 KiB) and force one at double the
/// surviving size (at least 4 MiB).
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub heap_growth_ratio: f64,
    pub heap_growth_min: usize,
    pub forced_growth_ratio: f64,
    pub forced_growth_min: usize,
    /// How long a collection initiator waits for every other thread to
    /// reach a safe point before abandoning the cycle.
    pub park_timeout: Duration,
    /// Sweep the initiator's heap inside `collect_garbage` (the
    /// default) instead of deferring it to the next safe point.
    pub eager_initiator_sweep: bool,
}

impl Default for GcConfig {
    fn default() -> GcConfig {
        GcConfig {
            heap_growth_ratio: 0.5,
            heap_growth_min: 512 * 1024,
            forced_growth_ratio: 1.0,
            forced_growth_min: 4 * 1024 * 1024,
            park_timeout: Duration::from_millis(100),
            eager_initiator_sweep: true,
        }
    }
}

/// Handle returned by [`GcRuntime::register_root`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RootId(u64);

struct RootEntry {
    id: u64,
    object: NonNull<u8>,
    desc: Option<&'static TypeDescriptor>,
}

#[derive(Default)]
struct PersistentRoots {
    next_id: u64,
    entries: Vec<RootEntry>,
}

pub struct GcRuntime {
    config: GcConfig,
    threads: Mutex<Vec<NonNull<ThreadState>>>,
    barrier: SafePointBarrier,
    caches: Arc<AddressCaches>,
    roots: Mutex<PersistentRoots>,
    // Address of the ThreadState driving the current cycle, 0 if none.
    active_initiator: AtomicUsize,
    stats: Mutex<GcStats>,
}

// SAFETY: the registered ThreadState pointers are dereferenced only by
// their owning thread or by an initiator that holds the registry lock
// and has parked every other thread; root objects stay valid while
// registered because registration itself keeps them marked.
unsafe impl Send for GcRuntime {}
unsafe impl Sync for GcRuntime {}

impl GcRuntime {
    pub fn new(config: GcConfig) -> Arc<GcRuntime> {
        Arc::new(GcRuntime {
            config,
            threads: Mutex::new(Vec::new()),
            barrier: SafePointBarrier::new(),
            caches: Arc::new(AddressCaches::new()),
            roots: Mutex::new(PersistentRoots::default()),
            active_initiator: AtomicUsize::new(0),
            stats: Mutex::new(GcStats::default()),
        })
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub(crate) fn barrier(&self) -> &SafePointBarrier {
        &self.barrier
    }

    pub(crate) fn caches(&self) -> &Arc<AddressCaches> {
        &self.caches
    }

    pub(crate) fn register_thread(&self, thread: NonNull<ThreadState>) {
        self.threads.lock().push(thread);
    }

    pub(crate) fn unregister_thread(&self, thread: NonNull<ThreadState>) {
        self.threads.lock().retain(|t| *t != thread);
    }

    /// The registry lock doubles as the collection lock: holding it
    /// for a full cycle keeps the thread set stable and serializes
    /// concurrent initiators.
    pub(crate) fn try_lock_threads(
        &self,
    ) -> Option<MutexGuard<'_, Vec<NonNull<ThreadState>>>> {
        self.threads.try_lock()
    }

    pub fn attached_thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Keep `object` alive across collections until unregistered. Pass
    /// the object's descriptor so its references are traced; `None`
    /// roots a leaf object.
    pub fn register_root(
        &self,
        object: NonNull<u8>,
        desc: Option<&'static TypeDescriptor>,
    ) -> RootId {
        let mut roots = self.roots.lock();
        roots.next_id += 1;
        let id = roots.next_id;
        roots.entries.push(RootEntry { id, object, desc });
        RootId(id)
    }

    pub fn unregister_root(&self, id: RootId) {
        self.roots.lock().retain_id(id.0);
    }

    /// [`GcRuntime::register_root`] with RAII unregistration.
    pub fn root_guard(
        self: &Arc<Self>,
        object: NonNull<u8>,
        desc: Option<&'static TypeDescriptor>,
    ) -> PersistentRoot {
        PersistentRoot {
            runtime: self.clone(),
            id: self.register_root(object, desc),
        }
    }

    pub(crate) fn visit_roots(&self, visitor: &mut dyn Visitor) {
        for entry in &self.roots.lock().entries {
            match entry.desc {
                Some(desc) => visitor.visit(entry.object, desc),
                None => visitor.visit_leaf(entry.object),
            }
        }
    }

    pub(crate) fn active_initiator(&self) -> usize {
        self.active_initiator.load(Ordering::Relaxed)
    }

    pub(crate) fn set_active_initiator(&self, addr: usize) {
        self.active_initiator.store(addr, Ordering::Relaxed);
    }

    pub fn stats(&self) -> GcStats {
        *self.stats.lock()
    }

    pub(crate) fn record_sweep(&self, outcome: &SweepOutcome) {
        let mut stats = self.stats.lock();
        stats.swept_bytes += outcome.swept_bytes as u64;
        stats.pages_pooled += outcome.pages_pooled as u64;
    }

    pub(crate) fn note_abandoned(&self) {
        self.stats.lock().abandoned += 1;
    }

    pub(crate) fn note_collection(&self, marked: usize, parked: usize) {
        let mut stats = self.stats.lock();
        stats.collections += 1;
        stats.objects_marked_last = marked;
        stats.threads_parked_last = parked;
    }
}

impl PersistentRoots {
    fn retain_id(&mut self, id: u64) {
        self.entries.retain(|entry| entry.id != id);
    }
}

/// RAII guard for a persistent root; dropping it unregisters.
pub struct PersistentRoot {
    runtime: Arc<GcRuntime>,
    id: RootId,
}

impl PersistentRoot {
    pub fn id(&self) -> RootId {
        self.id
    }
}

impl Drop for PersistentRoot {
    fn drop(&mut self) {
        self.runtime.unregister_root(self.id);
    }
}
