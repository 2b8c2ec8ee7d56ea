//! Rendezvous that stops every attached thread at a safe point before
//! a collection cycle. The initiator raises a park request, counts the
//! threads that still have to arrive, and waits on a deadline; each
//! mutator thread checks the request at its safe points and blocks
//! until the cycle resumes the world.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::threads::ThreadState;

#[derive(Debug, Default)]
struct BarrierState {
    park_requested: bool,
    unparked: usize,
}

#[derive(Debug, Default)]
pub struct SafePointBarrier {
    inner: Mutex<BarrierState>,
    parked_cv: Condvar,
    resume_cv: Condvar,
}

impl SafePointBarrier {
    pub fn new() -> SafePointBarrier {
        SafePointBarrier::default()
    }

    /// Ask every thread in `others` to stop and wait for them, up to
    /// `timeout`. Threads already inside a safe point scope count as
    /// parked immediately. Returns false if the deadline passed with
    /// threads still running; the request is withdrawn in that case
    /// and any threads that did park are released.
    pub fn park_others(
        &self,
        others: &[std::ptr::NonNull<ThreadState>],
        timeout: Duration,
    ) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.park_requested, "overlapping park requests");
        inner.park_requested = true;
        inner.unparked = 0;
        for &thread in others {
            // SAFETY: the registry lock held by the caller keeps every
            // registered ThreadState alive for the whole cycle.
            let thread = unsafe { thread.as_ref() };
            if !thread.is_at_safe_point() {
                inner.unparked += 1;
                thread.run_interruptor();
            }
        }
        let deadline = Instant::now() + timeout;
        while inner.unparked > 0 {
            if self
                .parked_cv
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                inner.park_requested = false;
                self.resume_cv.notify_all();
                return false;
            }
        }
        true
    }

    /// Release every parked thread after the cycle.
    pub fn resume_others(&self) {
        let mut inner = self.inner.lock();
        inner.park_requested = false;
        self.resume_cv.notify_all();
    }

    /// Mutator side of [`SafePointBarrier::park_others`]: if a park is
    /// requested, report in and block until the world resumes. The
    /// caller records its stack position before calling. Returns
    /// whether the thread actually parked.
    pub fn check_and_park(&self, thread: &ThreadState) -> bool {
        let mut inner = self.inner.lock();
        if !inner.park_requested || thread.is_at_safe_point() {
            return false;
        }
        thread.set_at_safe_point(true);
        inner.unparked -= 1;
        self.parked_cv.notify_one();
        while inner.park_requested {
            self.resume_cv.wait(&mut inner);
        }
        thread.set_at_safe_point(false);
        true
    }

    /// Enter a safe point scope without blocking: the thread keeps
    /// running (typically into blocking non-heap code) while counting
    /// as parked. `copy_stack` runs only when a collection is already
    /// waiting on this thread, to snapshot the stack below the scope
    /// marker before execution moves on.
    pub fn enter_safe_point(
        &self,
        thread: &ThreadState,
        copy_stack: impl FnOnce(),
    ) {
        let mut inner = self.inner.lock();
        debug_assert!(!thread.is_at_safe_point(), "nested safe point scope");
        thread.set_at_safe_point(true);
        if inner.park_requested {
            copy_stack();
            inner.unparked -= 1;
            self.parked_cv.notify_one();
        }
    }

    /// Leave a safe point scope, blocking first if a collection is in
    /// flight (the collector may be scanning this thread's stack).
    pub fn leave_safe_point(&self, thread: &ThreadState) {
        let mut inner = self.inner.lock();
        while inner.park_requested {
            self.resume_cv.wait(&mut inner);
        }
        thread.set_at_safe_point(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parking_nobody_succeeds_immediately() {
        let barrier = SafePointBarrier::new();
        let start = Instant::now();
        assert!(barrier.park_others(&[], Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
        barrier.resume_others();
    }

    #[test]
    fn resume_without_a_request_is_harmless() {
        let barrier = SafePointBarrier::new();
        barrier.resume_others();
        barrier.resume_others();
    }
}
