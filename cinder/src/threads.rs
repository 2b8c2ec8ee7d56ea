//! Per-thread collector state and the public attachment handle. A
//! thread that wants to allocate managed objects attaches once, then
//! cooperates by calling [`AttachedThread::safe_point`] from its main
//! loop or wrapping blocking regions in a safe point scope.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::{self, StackState};
use crate::header::TypeDescriptor;
use crate::heap::ThreadLocalHeap;
use crate::memory::round_up;
use crate::runtime::GcRuntime;
use crate::system;
use crate::visitor::Visitor;

const WORD: usize = std::mem::size_of::<usize>();

/// How many forced collections detach attempts before concluding the
/// heap cannot drain.
const DETACH_GC_ATTEMPTS: usize = 5;

/// Callback fired by a collection initiator at a thread that has not
/// reached a safe point yet, so event-loop style threads can be woken
/// towards one. Runs on the initiator's thread and must not block.
pub type Interruptor = Box<dyn Fn() + Send + Sync>;

/// Hook run on the owning thread at the start of detach, before the
/// drain collections. Typical use: dropping embedder-side structures
/// that still reference managed objects.
pub type DetachHook = Box<dyn FnOnce()>;

/// Collector-side view of one attached thread. Registered by address
/// in the runtime; the owning thread mutates the heap, the collector
/// does so only while the owner is parked.
pub struct ThreadState {
    runtime: Arc<GcRuntime>,
    heap: UnsafeCell<ThreadLocalHeap>,
    stack_top: usize,
    at_safe_point: AtomicBool,
    recorded_sp: AtomicUsize,
    recorded_state: AtomicU8,
    scope_marker: AtomicUsize,
    stack_copy: UnsafeCell<Vec<usize>>,
    sweep_pending: AtomicBool,
    gc_requested: AtomicBool,
    interruptor: Mutex<Option<Interruptor>>,
    cleanup_hooks: Mutex<Vec<DetachHook>>,
}

impl ThreadState {
    fn new(runtime: Arc<GcRuntime>, stack_top: usize) -> ThreadState {
        let heap = ThreadLocalHeap::new(runtime.caches().clone());
        ThreadState {
            runtime,
            heap: UnsafeCell::new(heap),
            stack_top,
            at_safe_point: AtomicBool::new(false),
            recorded_sp: AtomicUsize::new(0),
            recorded_state: AtomicU8::new(StackState::NoHeapPointers as u8),
            scope_marker: AtomicUsize::new(0),
            stack_copy: UnsafeCell::new(Vec::new()),
            sweep_pending: AtomicBool::new(false),
            gc_requested: AtomicBool::new(false),
            interruptor: Mutex::new(None),
            cleanup_hooks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn runtime(&self) -> &Arc<GcRuntime> {
        &self.runtime
    }

    /// # Safety
    /// Caller must be the owning thread, or a collector that has
    /// parked every thread but its own.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn heap_mut(&self) -> &mut ThreadLocalHeap {
        // SAFETY: caller contract
        unsafe { &mut *self.heap.get() }
    }

    pub(crate) fn is_at_safe_point(&self) -> bool {
        self.at_safe_point.load(Ordering::Relaxed)
    }

    pub(crate) fn set_at_safe_point(&self, value: bool) {
        self.at_safe_point.store(value, Ordering::Relaxed);
    }

    /// Remember where the stack ends and whether it may hold heap
    /// pointers, for the next stack scan.
    pub(crate) fn record_stack_position(&self, stack_state: StackState) {
        self.recorded_sp
            .store(system::approximate_stack_pointer(), Ordering::Relaxed);
        self.recorded_state
            .store(stack_state as u8, Ordering::Relaxed);
    }

    fn recorded_state(&self) -> StackState {
        match self.recorded_state.load(Ordering::Relaxed) {
            0 => StackState::NoHeapPointers,
            _ => StackState::MayContainHeapPointers,
        }
    }

    pub(crate) fn run_interruptor(&self) {
        if let Some(interruptor) = self.interruptor.lock().as_ref() {
            interruptor();
        }
    }

    pub(crate) fn set_sweep_pending(&self) {
        self.sweep_pending.store(true, Ordering::Release);
    }

    pub(crate) fn clear_gc_request(&self) {
        self.gc_requested.store(false, Ordering::Relaxed);
    }

    /// Snapshot the stack words between the current position and the
    /// scope marker, so references handed into the blocking region
    /// below the marker stay visible to the collector.
    fn copy_stack_slice(&self, marker: usize) {
        let low = round_up(system::approximate_stack_pointer(), WORD);
        // SAFETY: [low, marker) is this thread's own live stack.
        let copy = unsafe { &mut *self.stack_copy.get() };
        copy.clear();
        let mut addr = low;
        while addr + WORD <= marker {
            // SAFETY: in-bounds stack read on the owning thread
            copy.push(unsafe { (addr as *const usize).read_volatile() });
            addr += WORD;
        }
    }

    /// Feed every word that may be a heap pointer to the visitor. The
    /// caller guarantees this thread is either the initiator or parked.
    pub(crate) fn scan_stack(&self, visitor: &mut dyn Visitor) {
        if self.recorded_state() == StackState::NoHeapPointers {
            return;
        }
        let marker = self.scope_marker.load(Ordering::Relaxed);
        let low = if marker != 0 {
            marker
        } else {
            self.recorded_sp.load(Ordering::Relaxed)
        };
        let mut addr = round_up(low, WORD);
        while addr + WORD <= self.stack_top {
            // SAFETY: the owning thread is stopped at or above `low`,
            // so frames in [low, stack_top) are stable while we read.
            let word = unsafe { (addr as *const usize).read_volatile() };
            visitor.visit_word(word);
            addr += WORD;
        }
        // SAFETY: the owner wrote the copy before counting as parked
        // and will not touch it again until resumed.
        let copy = unsafe { &*self.stack_copy.get() };
        for &word in copy {
            visitor.visit_word(word);
        }
    }
}

/// RAII attachment of the current thread to a garbage-collected
/// runtime. Not `Send`: the handle must stay on the thread it was
/// created on. Dropping it detaches, which requires the heap to drain;
/// objects still reachable from persistent roots make detach panic.
pub struct AttachedThread {
    state: Box<ThreadState>,
    detached: bool,
    _not_send: PhantomData<*const ()>,
}

impl AttachedThread {
    pub fn attach(runtime: Arc<GcRuntime>) -> AttachedThread {
        let (_, stack_top) = system::thread_stack_bounds();
        let state = Box::new(ThreadState::new(runtime, stack_top));
        state.runtime.register_thread(NonNull::from(&*state));
        log::debug!(
            "thread attached, {} now attached",
            state.runtime.attached_thread_count()
        );
        AttachedThread {
            state,
            detached: false,
            _not_send: PhantomData,
        }
    }

    /// Allocate a zeroed managed object. `None` allocates a leaf (not
    /// traced, not finalized); `Some` attaches the descriptor the
    /// collector will trace and finalize through.
    ///
    /// Allocation is a safe point: it may run a pending sweep, and a
    /// heap past the forced-growth threshold collects immediately.
    pub fn allocate(
        &self,
        payload_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        self.perform_pending_sweep();
        let config = self.state.runtime.config();
        // SAFETY: owning thread, no cycle in progress on it
        let heap = unsafe { self.state.heap_mut() };
        if heap.should_force_gc(config) {
            gc::collect_garbage(&self.state, StackState::MayContainHeapPointers);
        } else if heap.should_gc(config) {
            self.state.gc_requested.store(true, Ordering::Relaxed);
        }
        // SAFETY: owning thread; the borrow above ended before any
        // collection could touch the heap
        let heap = unsafe { self.state.heap_mut() };
        heap.allocate(payload_size, desc)
    }

    /// Allocate on the dedicated large-object path regardless of size.
    pub fn allocate_large(
        &self,
        payload_size: usize,
        desc: Option<&'static TypeDescriptor>,
    ) -> NonNull<u8> {
        self.perform_pending_sweep();
        // SAFETY: owning thread, no cycle in progress on it
        unsafe { self.state.heap_mut() }.allocate_large(payload_size, desc)
    }

    /// Cooperative safe point: park if a collection is waiting, run a
    /// pending sweep, and honor a pending growth-triggered collection
    /// request.
    pub fn safe_point(&self, stack_state: StackState) {
        self.state.record_stack_position(stack_state);
        self.state.runtime.barrier().check_and_park(&self.state);
        self.perform_pending_sweep();
        if self.state.gc_requested.swap(false, Ordering::Relaxed) {
            gc::collect_garbage(&self.state, stack_state);
        }
    }

    /// Enter a region (typically around blocking calls) in which this
    /// thread counts as parked without having to poll
    /// [`AttachedThread::safe_point`]. The thread must not touch
    /// managed objects until the scope drops.
    pub fn enter_safe_point(&self, stack_state: StackState) -> SafePointScope<'_> {
        let marker = system::approximate_stack_pointer();
        let state = &*self.state;
        state.scope_marker.store(marker, Ordering::Relaxed);
        state.recorded_sp.store(marker, Ordering::Relaxed);
        state
            .recorded_state
            .store(stack_state as u8, Ordering::Relaxed);
        state.runtime.barrier().enter_safe_point(state, || {
            if stack_state == StackState::MayContainHeapPointers {
                state.copy_stack_slice(marker);
            }
        });
        SafePointScope { thread: self }
    }

    /// Collect now. Returns false if another thread failed to park
    /// within the configured timeout and the cycle was abandoned.
    pub fn collect_garbage(&self, stack_state: StackState) -> bool {
        self.perform_pending_sweep();
        self.state.clear_gc_request();
        gc::collect_garbage(&self.state, stack_state)
    }

    /// Install the callback a collection initiator fires when this
    /// thread has not reached a safe point yet.
    pub fn set_interruptor(&self, interruptor: Interruptor) {
        *self.state.interruptor.lock() = Some(interruptor);
    }

    /// Register a hook that [`AttachedThread::detach`] runs before the
    /// drain collections, in registration order.
    pub fn register_cleanup(&self, hook: DetachHook) {
        self.state.cleanup_hooks.lock().push(hook);
    }

    /// Whether the growth heuristic has asked for a collection that
    /// has not happened yet.
    pub fn gc_requested(&self) -> bool {
        self.state.gc_requested.load(Ordering::Relaxed)
    }

    pub fn allocated_since_gc(&self) -> usize {
        // SAFETY: owning thread reads its own heap counters
        unsafe { self.state.heap_mut() }.allocated_since_gc()
    }

    pub fn live_after_last_gc(&self) -> usize {
        // SAFETY: owning thread reads its own heap counters
        unsafe { self.state.heap_mut() }.live_after_last_gc()
    }

    pub fn is_heap_empty(&self) -> bool {
        // SAFETY: owning thread reads its own heap
        unsafe { self.state.heap_mut() }.is_empty()
    }

    fn perform_pending_sweep(&self) {
        if self.state.sweep_pending.swap(false, Ordering::AcqRel) {
            // SAFETY: owning thread sweeps its own heap
            let heap = unsafe { self.state.heap_mut() };
            let outcome = heap.sweep();
            self.state.runtime.record_sweep(&outcome);
            log::debug!(
                "lazy sweep reclaimed {} bytes, {} live, {} pages in use, {} pooled",
                outcome.swept_bytes,
                outcome.live_bytes,
                heap.page_count(),
                heap.pooled_pages()
            );
        }
    }

    /// Detach from the runtime. The heap must drain: a bounded number
    /// of forced collections reclaims everything unreachable, and
    /// anything still live afterwards is a caller bug.
    pub fn detach(mut self) {
        self.do_detach();
    }

    fn do_detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        // Hooks run first and may still touch managed objects; the
        // lock is released while they run, so a hook may register
        // further hooks and those run too.
        loop {
            let hooks = std::mem::take(&mut *self.state.cleanup_hooks.lock());
            if hooks.is_empty() {
                break;
            }
            for hook in hooks {
                hook();
            }
        }
        self.perform_pending_sweep();
        for _ in 0..DETACH_GC_ATTEMPTS {
            // SAFETY: owning thread
            if unsafe { self.state.heap_mut() }.is_empty() {
                break;
            }
            gc::collect_garbage(&self.state, StackState::NoHeapPointers);
        }
        // SAFETY: owning thread
        assert!(
            unsafe { self.state.heap_mut() }.is_empty(),
            "detaching thread still owns reachable objects"
        );
        self.state
            .runtime
            .unregister_thread(NonNull::from(&*self.state));
        log::debug!(
            "thread detached, {} still attached",
            self.state.runtime.attached_thread_count()
        );
    }
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        self.do_detach();
    }
}

/// Region in which the owning thread counts as parked. Leaving blocks
/// while a collection is scanning, then returns to mutator state.
pub struct SafePointScope<'a> {
    thread: &'a AttachedThread,
}

impl Drop for SafePointScope<'_> {
    fn drop(&mut self) {
        let state = &*self.thread.state;
        state.runtime.barrier().leave_safe_point(state);
        state.scope_marker.store(0, Ordering::Relaxed);
        // SAFETY: owning thread, world resumed
        unsafe { (*state.stack_copy.get()).clear() };
        self.thread.perform_pending_sweep();
    }
}
