//! A thread-local, stop-the-world, mark-and-sweep garbage collector.
//!
//! Each attached thread owns its heap; collection stops every attached
//! thread at a safe point, traces from persistent roots and from
//! conservatively scanned stacks, runs weak callbacks against final
//! liveness, and sweeps. The initiator sweeps eagerly, other threads
//! sweep lazily at their next safe point.

mod arena;
mod barrier;
mod cache;
mod gc;
mod header;
mod heap;
mod memory;
mod runtime;
mod system;
mod threads;
mod visitor;
mod worklist;

pub use arena::{LARGE_OBJECT_THRESHOLD, SweepOutcome};
pub use gc::{GcStats, StackState};
pub use header::{
    ALLOCATION_GRANULARITY, FinalizeFn, TraceFn, TypeDescriptor, WeakFn,
};
pub use memory::HEAP_PAGE_SIZE;
pub use runtime::{GcConfig, GcRuntime, PersistentRoot, RootId};
pub use threads::{AttachedThread, DetachHook, Interruptor, SafePointScope};
pub use visitor::{LivenessView, Visitor};
