//! The stop-the-world collection cycle: park every other thread, make
//! all heaps walkable, clear old marks, trace from persistent roots
//! and conservatively from thread stacks, run weak callbacks against
//! final liveness, then resume the world and sweep.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use crate::header::{HeaderKind, HeaderRef, TypeDescriptor, WeakFn};
use crate::runtime::GcRuntime;
use crate::threads::ThreadState;
use crate::visitor::{LivenessView, Visitor};
use crate::worklist::{CallbackStack, MarkItem, WeakItem};

/// What the initiating thread promises about its own stack (and what
/// parked threads promised at their last safe point).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackState {
    /// No references to managed objects live on the stack; the scan is
    /// skipped entirely. Breaking the promise frees reachable objects.
    NoHeapPointers = 0,
    /// Scan the stack conservatively; anything that looks like a
    /// pointer into the heap pins its object.
    MayContainHeapPointers = 1,
}

/// Aggregate collector counters, readable via [`GcRuntime::stats`].
#[derive(Debug, Default, Copy, Clone)]
pub struct GcStats {
    pub collections: u64,
    /// Cycles abandoned because a thread missed the park deadline.
    pub abandoned: u64,
    pub objects_marked_last: usize,
    /// Threads parked by the last completed cycle; the initiator runs
    /// the cycle and is not counted.
    pub threads_parked_last: usize,
    pub swept_bytes: u64,
    pub pages_pooled: u64,
}

/// The stopped world as an RAII region: construction serializes
/// against other initiators, parks every other thread and records the
/// initiator; dropping it resumes the world. Nothing between the two
/// may block on another attached thread.
struct GcScope<'a> {
    runtime: &'a Arc<GcRuntime>,
    // Held for the whole cycle so the thread set cannot change.
    _threads: parking_lot::MutexGuard<'a, Vec<NonNull<ThreadState>>>,
    all: Vec<NonNull<ThreadState>>,
    others: Vec<NonNull<ThreadState>>,
}

impl<'a> GcScope<'a> {
    /// Stop the world, or return `None` if some thread missed the
    /// park deadline (in which case nothing was disturbed).
    fn stop_the_world(
        runtime: &'a Arc<GcRuntime>,
        initiator: &ThreadState,
        stack_state: StackState,
    ) -> Option<GcScope<'a>> {
        let me = initiator as *const ThreadState as usize;
        // The registry lock serializes initiators. While waiting for
        // it we keep servicing park requests so the running cycle can
        // scan us instead of timing out.
        let threads = loop {
            if let Some(guard) = runtime.try_lock_threads() {
                break guard;
            }
            initiator.record_stack_position(stack_state);
            runtime.barrier().check_and_park(initiator);
            std::thread::yield_now();
        };

        let others: Vec<NonNull<ThreadState>> = threads
            .iter()
            .copied()
            .filter(|t| t.as_ptr() as usize != me)
            .collect();
        if !runtime
            .barrier()
            .park_others(&others, runtime.config().park_timeout)
        {
            log::warn!(
                "abandoning collection: {} thread(s) missed the park deadline",
                others.len()
            );
            return None;
        }
        runtime.set_active_initiator(me);
        let all = threads.iter().copied().collect();
        Some(GcScope {
            runtime,
            _threads: threads,
            all,
            others,
        })
    }
}

impl Drop for GcScope<'_> {
    fn drop(&mut self) {
        self.runtime.set_active_initiator(0);
        self.runtime.barrier().resume_others();
    }
}

/// Run one full collection on behalf of `initiator`. Returns false if
/// the world could not be stopped in time and the cycle was abandoned
/// without any marking or sweeping.
pub(crate) fn collect_garbage(
    initiator: &ThreadState,
    stack_state: StackState,
) -> bool {
    let runtime = initiator.runtime().clone();
    assert!(
        runtime.active_initiator() != initiator as *const ThreadState as usize,
        "collection re-entered from a trace, weak or finalize callback"
    );

    let started = Instant::now();
    initiator.record_stack_position(stack_state);
    let Some(scope) = GcScope::stop_the_world(&runtime, initiator, stack_state)
    else {
        runtime.note_abandoned();
        return false;
    };
    runtime.caches().flush_all();

    for &thread in &scope.all {
        // SAFETY: every thread but the initiator is parked; the
        // registry lock keeps the pointers alive.
        let heap = unsafe { thread.as_ref().heap_mut() };
        heap.make_consistent_for_gc();
        // Threads with a sweep still pending carry mark bits from the
        // previous cycle; clearing them (without finalizing anything)
        // keeps this trace sound.
        heap.clear_marks();
    }

    let mut visitor = MarkingVisitor::new(&runtime, &scope.all);
    runtime.visit_roots(&mut visitor);
    for &thread in &scope.all {
        // SAFETY: parked or the initiator itself, stacks are stable
        unsafe { thread.as_ref() }.scan_stack(&mut visitor);
    }
    visitor.drain();
    visitor.process_weak();
    let marked = visitor.marked_count();
    drop(visitor);

    for &thread in &scope.others {
        // SAFETY: registry lock keeps the pointer alive
        let thread = unsafe { thread.as_ref() };
        thread.set_sweep_pending();
        thread.clear_gc_request();
    }
    runtime.note_collection(marked, scope.others.len());
    drop(scope);

    if runtime.config().eager_initiator_sweep {
        // SAFETY: sweeping our own heap on our own thread
        let outcome = unsafe { initiator.heap_mut() }.sweep();
        runtime.record_sweep(&outcome);
        log::debug!(
            "gc marked {marked} objects, swept {} bytes in {:?}",
            outcome.swept_bytes,
            started.elapsed()
        );
    } else {
        initiator.set_sweep_pending();
        log::debug!("gc marked {marked} objects in {:?}", started.elapsed());
    }
    true
}

/// The visitor driving a cycle: exact references mark directly,
/// candidate words resolve through the page set (accelerated by the
/// address caches), and traceable survivors feed the worklist.
struct MarkingVisitor<'a> {
    runtime: &'a Arc<GcRuntime>,
    threads: &'a [NonNull<ThreadState>],
    marking: CallbackStack<MarkItem>,
    weak: CallbackStack<WeakItem>,
    marked: usize,
}

impl<'a> MarkingVisitor<'a> {
    fn new(
        runtime: &'a Arc<GcRuntime>,
        threads: &'a [NonNull<ThreadState>],
    ) -> MarkingVisitor<'a> {
        MarkingVisitor {
            runtime,
            threads,
            marking: CallbackStack::new(),
            weak: CallbackStack::new(),
            marked: 0,
        }
    }

    fn marked_count(&self) -> usize {
        self.marked
    }

    /// Mark a header resolved from a conservative word. Objects whose
    /// type starts with a vtable pointer that is still zero were caught
    /// mid-construction: they survive but are not traced.
    fn mark_resolved(&mut self, header: HeaderRef) {
        if header.is_marked() {
            return;
        }
        header.mark();
        self.marked += 1;
        let Some(desc) = header.descriptor() else {
            return;
        };
        if desc.has_vtable {
            // SAFETY: live payload, first word is the vtable slot
            let vtable =
                unsafe { header.object_address().cast::<usize>().as_ptr().read() };
            if vtable == 0 {
                return;
            }
        }
        if desc.trace.is_some() {
            self.marking.push(MarkItem {
                object: header.object_address(),
                desc,
            });
        }
    }

    fn drain(&mut self) {
        while let Some(item) = self.marking.pop() {
            if let Some(trace) = item.desc.trace {
                // SAFETY: item was pushed for a marked live object of
                // the descriptor's type
                unsafe { trace(self, item.object) };
            }
        }
    }

    fn process_weak(&mut self) {
        debug_assert!(self.marking.is_empty(), "weak processing before drain");
        let mut view = LivenessView::new();
        while let Some(item) = self.weak.pop() {
            // SAFETY: registered during the trace of a live object
            unsafe { (item.callback)(&mut view, item.object) };
        }
    }
}

impl Visitor for MarkingVisitor<'_> {
    fn visit(&mut self, object: NonNull<u8>, desc: &'static TypeDescriptor) {
        // SAFETY: exact references always name described payloads
        let header = unsafe { HeaderRef::for_object(object, HeaderKind::Described) };
        if header.is_marked() {
            return;
        }
        header.mark();
        self.marked += 1;
        if desc.trace.is_some() {
            self.marking.push(MarkItem { object, desc });
        }
    }

    fn visit_leaf(&mut self, object: NonNull<u8>) {
        // SAFETY: exact leaf references name plain-arena payloads
        let header = unsafe { HeaderRef::for_object(object, HeaderKind::Plain) };
        if !header.is_marked() {
            header.mark();
            self.marked += 1;
        }
    }

    fn visit_word(&mut self, word: usize) {
        if word == 0 {
            return;
        }
        if self.runtime.caches().does_not_contain.lock().lookup(word).is_some() {
            return;
        }
        // A positive hit names the thread whose heap owns the page, so
        // the cross-thread walk is skipped.
        let cached = self.runtime.caches().contains.lock().lookup(word);
        let owner = cached
            .and_then(|addr| {
                self.threads
                    .iter()
                    .copied()
                    .find(|t| t.as_ptr() as usize == addr)
            })
            .or_else(|| {
                self.threads.iter().copied().find(|&thread| {
                    // SAFETY: world stopped, registry lock held by the
                    // cycle
                    unsafe { thread.as_ref().heap_mut() }.contains(word)
                })
            });
        match owner {
            Some(thread) => {
                self.runtime
                    .caches()
                    .contains
                    .lock()
                    .add(word, thread.as_ptr() as usize);
                // SAFETY: world stopped, registry lock held by the cycle
                let heap = unsafe { thread.as_ref().heap_mut() };
                // The word may land in free space of an owned page:
                // that resolves to no header, but the page is still
                // heap memory and must stay out of the negative cache.
                if let Some(header) = heap.find_header(word) {
                    self.mark_resolved(header);
                }
            }
            None => {
                self.runtime.caches().does_not_contain.lock().add(word, 0);
            }
        }
    }

    fn register_weak(&mut self, object: NonNull<u8>, callback: WeakFn) {
        self.weak.push(WeakItem { object, callback });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::TypeDescriptor;
    use crate::runtime::GcConfig;
    use crate::threads::AttachedThread;
    use std::hint::black_box;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    fn patient_runtime() -> Arc<GcRuntime> {
        GcRuntime::new(GcConfig {
            park_timeout: Duration::from_secs(10),
            ..GcConfig::default()
        })
    }

    static LEAF_DESC: TypeDescriptor = TypeDescriptor::LEAF;

    #[test]
    fn unreferenced_objects_are_reclaimed() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());
        for _ in 0..256 {
            thread.allocate(96, None);
            thread.allocate(96, Some(&LEAF_DESC));
        }
        assert!(!thread.is_heap_empty());
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(thread.is_heap_empty(), "nothing was reachable");
        assert_eq!(thread.live_after_last_gc(), 0);
        assert_eq!(rt.stats().collections, 1);
    }

    // Trace callback for a one-slot object: the slot holds either zero
    // or the address of another managed object.
    unsafe fn trace_one_slot(visitor: &mut dyn Visitor, object: NonNull<u8>) {
        // SAFETY: holder payloads are at least one word
        let word = unsafe { object.cast::<usize>().as_ptr().read() };
        visitor.visit_word(word);
    }

    static HOLDER_DESC: TypeDescriptor = TypeDescriptor {
        trace: Some(trace_one_slot),
        finalize: None,
        has_vtable: false,
    };

    #[test]
    fn rooted_objects_and_their_references_survive() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());

        let leaf = thread.allocate(32, None);
        // SAFETY: fresh 32-byte payload
        unsafe { leaf.cast::<u64>().as_ptr().write(0x5EED) };
        let holder = thread.allocate(16, Some(&HOLDER_DESC));
        // SAFETY: fresh 16-byte payload, first slot stores the edge
        unsafe {
            holder.cast::<usize>().as_ptr().write(leaf.as_ptr() as usize)
        };
        let root = rt.root_guard(holder, Some(&HOLDER_DESC));

        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(!thread.is_heap_empty());
        // SAFETY: both objects survived via the root
        unsafe {
            assert_eq!(leaf.cast::<u64>().as_ptr().read(), 0x5EED);
            assert_eq!(
                holder.cast::<usize>().as_ptr().read(),
                leaf.as_ptr() as usize
            );
        }

        drop(root);
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(thread.is_heap_empty(), "unrooted graph must be reclaimed");
    }

    #[test]
    fn stack_references_pin_objects_conservatively() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());

        let object = thread.allocate(64, None);
        // SAFETY: fresh 64-byte payload
        unsafe { object.cast::<u64>().as_ptr().write(0xDEAD_BEEF) };
        // Force the pointer into a scannable stack slot.
        let pinned = &object;
        black_box(pinned);

        assert!(thread.collect_garbage(StackState::MayContainHeapPointers));
        // SAFETY: the stack reference kept the object alive
        unsafe { assert_eq!(object.cast::<u64>().as_ptr().read(), 0xDEAD_BEEF) };
        assert!(!thread.is_heap_empty());
        black_box(pinned);

        // Without the stack promise the same object dies.
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(thread.is_heap_empty());
    }

    // Trace callback for a two-slot object, visiting both words in
    // slot order.
    unsafe fn trace_two_slots(visitor: &mut dyn Visitor, object: NonNull<u8>) {
        // SAFETY: pair payloads are at least two words
        unsafe {
            let slots = object.cast::<usize>().as_ptr();
            visitor.visit_word(slots.read());
            visitor.visit_word(slots.add(1).read());
        }
    }

    static PAIR_DESC: TypeDescriptor = TypeDescriptor {
        trace: Some(trace_two_slots),
        finalize: None,
        has_vtable: false,
    };

    #[test]
    fn free_space_probe_does_not_hide_live_page_neighbors() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());

        let leaf = thread.allocate(32, None);
        // SAFETY: fresh 32-byte payload
        unsafe { leaf.cast::<u64>().as_ptr().write(0xC0FFEE) };
        let holder = thread.allocate(16, Some(&PAIR_DESC));
        // The first word lands in free space of the leaf's page, the
        // second names the leaf itself. Resolving the first must not
        // memoize the page as non-heap and hide the second.
        // SAFETY: fresh 16-byte payload with two word slots
        unsafe {
            let slots = holder.cast::<usize>().as_ptr();
            slots.write(leaf.as_ptr() as usize + 4096);
            slots.add(1).write(leaf.as_ptr() as usize);
        }
        let root = rt.root_guard(holder, Some(&PAIR_DESC));

        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(!thread.is_heap_empty());
        // SAFETY: the traced reference kept the leaf alive
        unsafe {
            assert_eq!(
                leaf.cast::<u64>().as_ptr().read(),
                0xC0FFEE,
                "a live object must survive a free-space probe into its page"
            );
        }

        drop(root);
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(thread.is_heap_empty());
    }

    static WEAK_SAW_ALIVE: AtomicUsize = AtomicUsize::new(0);
    static WEAK_SAW_DEAD: AtomicUsize = AtomicUsize::new(0);

    unsafe fn weak_fixup(view: &mut LivenessView<'_>, object: NonNull<u8>) {
        // SAFETY: the holder payload is one word naming a described
        // object, still unswept at weak processing time
        unsafe {
            let slot = object.cast::<usize>().as_ptr();
            let target = slot.read();
            if target == 0 {
                return;
            }
            let target_ptr = NonNull::new_unchecked(target as *mut u8);
            if view.is_alive(target_ptr) {
                WEAK_SAW_ALIVE.fetch_add(1, Ordering::SeqCst);
            } else {
                slot.write(0);
                WEAK_SAW_DEAD.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    unsafe fn trace_weak_holder(visitor: &mut dyn Visitor, object: NonNull<u8>) {
        visitor.register_weak(object, weak_fixup);
    }

    static WEAK_HOLDER_DESC: TypeDescriptor = TypeDescriptor {
        trace: Some(trace_weak_holder),
        finalize: None,
        has_vtable: false,
    };

    #[test]
    fn weak_callbacks_observe_final_liveness() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());

        let target = thread.allocate(24, Some(&LEAF_DESC));
        let holder = thread.allocate(8, Some(&WEAK_HOLDER_DESC));
        // SAFETY: one-word payload stores the weak edge
        unsafe {
            holder.cast::<usize>().as_ptr().write(target.as_ptr() as usize)
        };
        let holder_root = rt.root_guard(holder, Some(&WEAK_HOLDER_DESC));

        // Target strongly rooted: the weak edge must survive.
        let target_root = rt.root_guard(target, Some(&LEAF_DESC));
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert_eq!(WEAK_SAW_ALIVE.load(Ordering::SeqCst), 1);
        // SAFETY: holder survived via its root
        unsafe {
            assert_eq!(
                holder.cast::<usize>().as_ptr().read(),
                target.as_ptr() as usize,
                "weak edge to a live object stays intact"
            );
        }

        // Drop the strong root: the callback must clear the edge.
        drop(target_root);
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert_eq!(WEAK_SAW_DEAD.load(Ordering::SeqCst), 1);
        // SAFETY: holder still rooted
        unsafe {
            assert_eq!(
                holder.cast::<usize>().as_ptr().read(),
                0,
                "weak edge to a dead object is cleared"
            );
        }
        drop(holder_root);
    }

    static TRACED_UNDER_CONSTRUCTION: AtomicBool = AtomicBool::new(false);

    unsafe fn trace_through_vtable(_v: &mut dyn Visitor, _object: NonNull<u8>) {
        TRACED_UNDER_CONSTRUCTION.store(true, Ordering::SeqCst);
    }

    static VTABLE_DESC: TypeDescriptor = TypeDescriptor {
        trace: Some(trace_through_vtable),
        finalize: None,
        has_vtable: true,
    };

    #[test]
    fn conservative_hit_on_unconstructed_object_marks_without_tracing() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());

        // Payloads are zeroed, so the vtable slot reads as unwritten.
        let object = thread.allocate(32, Some(&VTABLE_DESC));
        let pinned = &object;
        black_box(pinned);

        assert!(thread.collect_garbage(StackState::MayContainHeapPointers));
        assert!(
            !TRACED_UNDER_CONSTRUCTION.load(Ordering::SeqCst),
            "a zero vtable slot must suppress tracing"
        );
        assert!(!thread.is_heap_empty(), "the object itself must survive");
        black_box(pinned);

        thread.collect_garbage(StackState::NoHeapPointers);
    }

    #[test]
    fn collection_parks_every_other_thread() {
        // Growth floor high enough that workers never initiate cycles
        // of their own.
        let rt = GcRuntime::new(GcConfig {
            heap_growth_min: 1 << 30,
            forced_growth_min: 1 << 31,
            park_timeout: Duration::from_secs(10),
            ..GcConfig::default()
        });
        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(std::sync::Barrier::new(4));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let rt = rt.clone();
                let stop = stop.clone();
                let ready = ready.clone();
                std::thread::spawn(move || {
                    let thread = AttachedThread::attach(rt);
                    ready.wait();
                    while !stop.load(Ordering::Relaxed) {
                        thread.allocate(64, None);
                        thread.safe_point(StackState::NoHeapPointers);
                    }
                })
            })
            .collect();

        let thread = AttachedThread::attach(rt.clone());
        ready.wait();
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        let stats = rt.stats();
        assert_eq!(
            stats.threads_parked_last, 3,
            "every worker parked; the initiator is not counted"
        );
        assert!(stats.collections >= 1);

        stop.store(true, Ordering::Relaxed);
        {
            // Workers stop the world while draining their heaps at
            // detach; count as parked until they are gone.
            let _scope = thread.enter_safe_point(StackState::NoHeapPointers);
            for worker in workers {
                worker.join().unwrap();
            }
        }
    }

    #[test]
    fn uncooperative_thread_abandons_the_cycle() {
        let rt = GcRuntime::new(GcConfig {
            park_timeout: Duration::from_millis(50),
            ..GcConfig::default()
        });
        let (attached_tx, attached_rx) = mpsc::channel();

        let worker = {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let thread = AttachedThread::attach(rt);
                attached_tx.send(()).unwrap();
                // Never reaches a safe point during the nap.
                std::thread::sleep(Duration::from_millis(400));
                thread.detach();
            })
        };

        let thread = AttachedThread::attach(rt.clone());
        attached_rx.recv().unwrap();
        assert!(
            !thread.collect_garbage(StackState::NoHeapPointers),
            "a sleeping thread must abort the cycle at the deadline"
        );
        assert_eq!(rt.stats().abandoned, 1);
        assert_eq!(rt.stats().collections, 0);

        {
            // Count as parked while waiting, in case the worker's
            // detach needs to stop the world.
            let _scope = thread.enter_safe_point(StackState::NoHeapPointers);
            worker.join().unwrap();
        }
    }

    #[test]
    fn safe_point_scope_counts_as_parked() {
        let rt = patient_runtime();
        let (in_scope_tx, in_scope_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();

        let worker = {
            let rt = rt.clone();
            std::thread::spawn(move || {
                let thread = AttachedThread::attach(rt);
                thread.allocate(256, None);
                {
                    let _scope =
                        thread.enter_safe_point(StackState::NoHeapPointers);
                    in_scope_tx.send(()).unwrap();
                    // Blocked without polling safe_point.
                    resume_rx.recv().unwrap();
                }
                thread.detach();
            })
        };

        let thread = AttachedThread::attach(rt.clone());
        in_scope_rx.recv().unwrap();
        let started = Instant::now();
        assert!(
            thread.collect_garbage(StackState::NoHeapPointers),
            "a thread inside a scope must not block the cycle"
        );
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "the cycle should not have waited on the blocked thread"
        );
        resume_tx.send(()).unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn growth_heuristic_requests_exactly_one_collection() {
        let rt = GcRuntime::new(GcConfig {
            heap_growth_min: 32 * 1024,
            park_timeout: Duration::from_secs(10),
            ..GcConfig::default()
        });
        let thread = AttachedThread::attach(rt.clone());

        while !thread.gc_requested() {
            thread.allocate(1016, None);
        }
        assert!(thread.allocated_since_gc() >= 32 * 1024);

        // More allocation keeps the one pending request latched.
        thread.allocate(1016, None);
        assert!(thread.gc_requested());

        thread.safe_point(StackState::NoHeapPointers);
        assert!(!thread.gc_requested(), "safe point honors the request");
        assert_eq!(rt.stats().collections, 1);
        assert_eq!(thread.allocated_since_gc(), 0);
        assert!(thread.is_heap_empty());
    }

    #[test]
    fn deferred_initiator_sweep_runs_at_the_next_safe_point() {
        let rt = GcRuntime::new(GcConfig {
            eager_initiator_sweep: false,
            park_timeout: Duration::from_secs(10),
            ..GcConfig::default()
        });
        let thread = AttachedThread::attach(rt.clone());
        for _ in 0..64 {
            thread.allocate(256, None);
        }
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        // Marking is done but the dead objects still occupy their
        // pages until this thread sweeps.
        assert!(!thread.is_heap_empty());
        thread.safe_point(StackState::NoHeapPointers);
        assert!(
            thread.is_heap_empty(),
            "the pending sweep must run at the next safe point"
        );
    }

    #[test]
    fn interruptor_fires_when_a_thread_must_be_parked() {
        let rt = patient_runtime();
        let interrupted = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let worker = {
            let rt = rt.clone();
            let interrupted = interrupted.clone();
            std::thread::spawn(move || {
                let thread = AttachedThread::attach(rt);
                let flag = interrupted.clone();
                thread.set_interruptor(Box::new(move || {
                    flag.store(true, Ordering::SeqCst);
                }));
                ready_tx.send(()).unwrap();
                // Refuses to reach a safe point until interrupted, so
                // the cycle can only finish through the interruptor.
                while !interrupted.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
                thread.safe_point(StackState::NoHeapPointers);
                done_rx.recv().unwrap();
            })
        };

        let thread = AttachedThread::attach(rt.clone());
        ready_rx.recv().unwrap();
        assert!(thread.collect_garbage(StackState::NoHeapPointers));
        assert!(interrupted.load(Ordering::SeqCst));
        done_tx.send(()).unwrap();
        {
            let _scope = thread.enter_safe_point(StackState::NoHeapPointers);
            worker.join().unwrap();
        }
    }

    static STRESS_FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe fn count_finalize(_object: NonNull<u8>) {
        STRESS_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    static FINALIZED_DESC: TypeDescriptor = TypeDescriptor {
        trace: None,
        finalize: Some(count_finalize),
        has_vtable: false,
    };

    #[test]
    fn every_dead_object_is_finalized_across_cycles() {
        let rt = patient_runtime();
        let thread = AttachedThread::attach(rt.clone());
        let total = 300usize;
        for batch in 0..3 {
            for _ in 0..total / 3 {
                thread.allocate(48, Some(&FINALIZED_DESC));
            }
            thread.collect_garbage(StackState::NoHeapPointers);
            assert_eq!(
                STRESS_FINALIZED.load(Ordering::SeqCst),
                (batch + 1) * (total / 3)
            );
        }
        assert!(thread.is_heap_empty());
    }
}
