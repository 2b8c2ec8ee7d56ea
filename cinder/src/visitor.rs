//! The tracing seam between managed types and the collector. A type's
//! trace callback receives a `&mut dyn Visitor` and reports every
//! reference the object holds; the collector supplies the visitor that
//! turns those reports into mark-worklist entries.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::header::{HeaderKind, HeaderRef, TypeDescriptor, WeakFn};

pub trait Visitor {
    /// Report a reference to a described (traceable) object.
    fn visit(&mut self, object: NonNull<u8>, desc: &'static TypeDescriptor);

    /// Report a reference to a leaf object (plain header, nothing to
    /// trace inside it).
    fn visit_leaf(&mut self, object: NonNull<u8>);

    /// Report a machine word that may or may not be an interior
    /// pointer into the heap. Non-pointers are silently ignored.
    fn visit_word(&mut self, word: usize);

    /// Ask to be called back after marking completes, with final
    /// liveness visible. `object` is passed back to the callback.
    fn register_weak(&mut self, object: NonNull<u8>, callback: WeakFn);
}

/// Read-only liveness oracle handed to weak callbacks once marking is
/// fully drained. It can answer "did this survive?" but offers no way
/// to mark, so weak processing cannot grow the live set.
pub struct LivenessView<'gc> {
    _cycle: PhantomData<&'gc ()>,
}

impl LivenessView<'_> {
    pub(crate) fn new() -> LivenessView<'static> {
        LivenessView { _cycle: PhantomData }
    }

    /// Whether a described object was reached during marking.
    ///
    /// # Safety
    /// `object` must be the payload address of an object allocated
    /// from a described arena (alive or dead this cycle, not yet
    /// swept).
    pub unsafe fn is_alive(&self, object: NonNull<u8>) -> bool {
        // SAFETY: caller contract
        let h = unsafe { HeaderRef::for_object(object, HeaderKind::Described) };
        h.is_marked()
    }

    /// Leaf-object variant of [`LivenessView::is_alive`].
    ///
    /// # Safety
    /// `object` must be the payload address of a plain-arena object.
    pub unsafe fn is_alive_leaf(&self, object: NonNull<u8>) -> bool {
        // SAFETY: caller contract
        let h = unsafe { HeaderRef::for_object(object, HeaderKind::Plain) };
        h.is_marked()
    }
}
