//! Worklists for the collection cycle: a stack of fixed-capacity
//! segments that grows by chaining a fresh segment and shrinks as
//! segments drain. One instance carries `(object, descriptor)` mark
//! work, another carries pending weak callbacks.

use std::mem::MaybeUninit;
use std::ptr::NonNull;

use crate::header::{TypeDescriptor, WeakFn};

pub const SEGMENT_CAPACITY: usize = 128;

/// An object discovered reachable whose own references still need
/// tracing.
#[derive(Debug, Copy, Clone)]
pub struct MarkItem {
    pub object: NonNull<u8>,
    pub desc: &'static TypeDescriptor,
}

/// A weak callback queued during tracing, run once after marking.
#[derive(Debug, Copy, Clone)]
pub struct WeakItem {
    pub object: NonNull<u8>,
    pub callback: WeakFn,
}

struct Segment<T> {
    items: [MaybeUninit<T>; SEGMENT_CAPACITY],
    len: usize,
    next: Option<Box<Segment<T>>>,
}

impl<T> Segment<T> {
    fn new(next: Option<Box<Segment<T>>>) -> Box<Segment<T>> {
        Box::new(Segment {
            items: [const { MaybeUninit::uninit() }; SEGMENT_CAPACITY],
            len: 0,
            next,
        })
    }
}

/// LIFO worklist of `Copy` items in chained segments.
pub struct CallbackStack<T: Copy> {
    head: Option<Box<Segment<T>>>,
}

impl<T: Copy> CallbackStack<T> {
    pub fn new() -> CallbackStack<T> {
        CallbackStack { head: None }
    }

    pub fn push(&mut self, item: T) {
        let needs_segment = match &self.head {
            Some(seg) => seg.len == SEGMENT_CAPACITY,
            None => true,
        };
        if needs_segment {
            self.head = Some(Segment::new(self.head.take()));
        }
        let seg = self.head.as_mut().expect("segment just ensured");
        seg.items[seg.len].write(item);
        seg.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        loop {
            let seg = self.head.as_mut()?;
            if seg.len == 0 {
                // Drained segment: unlink it and continue below.
                self.head = self.head.take().expect("checked above").next;
                continue;
            }
            seg.len -= 1;
            // SAFETY: slots below len were written by push
            return Some(unsafe { seg.items[seg.len].assume_init() });
        }
    }

    pub fn is_empty(&self) -> bool {
        let mut seg = self.head.as_deref();
        while let Some(s) = seg {
            if s.len > 0 {
                return false;
            }
            seg = s.next.as_deref();
        }
        true
    }
}

impl<T: Copy> Default for CallbackStack<T> {
    fn default() -> Self {
        CallbackStack::new()
    }
}
