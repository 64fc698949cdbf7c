//! Stackful fibers
//!
//! A fiber owns a stack from the [`StackPool`] and switches in user space.
//! The fiber records its yielder on first entry; the running coroutine uses
//! that pointer to suspend back into the worker loop that resumed it.

use super::{CoroutineBody, ResumeOutcome, StackPool};
use crate::error::fatal;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Where a fiber publishes its yielder
#[derive(Default)]
pub(crate) struct YielderSlot {
    yielder: AtomicPtr<Yielder<(), ()>>,
}

impl YielderSlot {
    fn publish(&self, yielder: &Yielder<(), ()>) {
        self.yielder
            .store(yielder as *const Yielder<(), ()> as *mut _, Ordering::Release);
    }

    /// Switch from the running fiber back to its resumer.
    pub(crate) fn suspend(&self) {
        let yielder = self.yielder.load(Ordering::Acquire);
        if yielder.is_null() {
            fatal("fiber suspended before it started");
        }
        // SAFETY: the pointer was published by this fiber on entry and refers
        // to a yielder on the fiber's own stack, which lives until the body
        // returns. Only the fiber itself calls `suspend`, so we are on that
        // stack right now.
        unsafe { (*yielder).suspend(()) }
    }
}

/// Fiber-based coroutine context
pub struct FiberContext {
    fiber: Coroutine<(), (), (), DefaultStack>,
    slot: Arc<YielderSlot>,
}

// SAFETY: the body is `Send`, and the runtime never holds thread-bound state
// across a suspension point (switching is fatal while a switch-disabled
// guard is alive). A suspended fiber can therefore be resumed from whichever
// worker thread it was migrated to.
unsafe impl Send for FiberContext {}

impl FiberContext {
    pub(crate) fn new(stack: DefaultStack, body: CoroutineBody) -> Self {
        let slot = Arc::new(YielderSlot::default());
        let entry_slot = slot.clone();
        let fiber = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
            entry_slot.publish(yielder);
            body();
        });
        Self { fiber, slot }
    }

    pub(crate) fn yielder_slot(&self) -> Arc<YielderSlot> {
        self.slot.clone()
    }

    pub fn started(&self) -> bool {
        self.fiber.started()
    }

    pub fn done(&self) -> bool {
        self.fiber.done()
    }

    pub(crate) fn resume(&mut self) -> ResumeOutcome {
        if self.fiber.done() {
            fatal("resuming a finished fiber");
        }
        match self.fiber.resume(()) {
            CoroutineResult::Yield(()) => ResumeOutcome::Suspended,
            CoroutineResult::Return(()) => ResumeOutcome::Finished,
        }
    }

    /// Return the stack to `pool`.
    ///
    /// A fiber abandoned mid-body (still blocked at shutdown) is leaked
    /// rather than force-unwound: its frames may hold scheduler state.
    pub(crate) fn recycle(self, pool: &StackPool) {
        if !self.fiber.started() || self.fiber.done() {
            pool.release(self.fiber.into_stack());
        } else {
            tracing::warn!("leaking stack of a fiber abandoned while suspended");
            std::mem::forget(self);
        }
    }
}
