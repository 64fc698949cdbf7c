//! Native execution contexts
//!
//! The native half of a coroutine. Three variants:
//!
//! - `Native`: no stack of its own; the coroutine runs on the OS thread that
//!   created it (main coroutine, exclusive-thread coroutines, scheduler loops).
//! - `Fiber`: a stackful fiber switched in user space on the worker thread.
//! - `Thread`: a dedicated OS thread that only runs while its worker hands it
//!   the baton.
//!
//! Switching is asymmetric: a worker loop resumes a context, and the context
//! suspends back to whichever loop resumed it.

mod fiber;
mod stack_pool;
mod thread;

pub use fiber::FiberContext;
pub use stack_pool::StackPool;
pub use thread::ThreadContext;

use crate::coroutine::Coroutine;
use crate::error::fatal;
use std::sync::Arc;

pub(crate) use fiber::YielderSlot;
pub(crate) use thread::Baton;

/// Closure a context executes once: the wrapped entrypoint
pub(crate) type CoroutineBody = Box<dyn FnOnce() + Send + 'static>;

/// Result of handing control to a context
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ResumeOutcome {
    /// The coroutine suspended and left a switch request
    Suspended,
    /// The body returned
    Finished,
}

/// Native half of a coroutine
pub enum CoroutineContext {
    Native,
    Fiber(FiberContext),
    Thread(ThreadContext),
}

impl CoroutineContext {
    pub fn kind(&self) -> &'static str {
        match self {
            CoroutineContext::Native => "native",
            CoroutineContext::Fiber(_) => "fiber",
            CoroutineContext::Thread(_) => "thread",
        }
    }

    pub(crate) fn suspender(&self) -> Suspender {
        match self {
            CoroutineContext::Native => Suspender::Native,
            CoroutineContext::Fiber(fiber) => Suspender::Fiber(fiber.yielder_slot()),
            CoroutineContext::Thread(thread) => Suspender::Thread(thread.baton()),
        }
    }

    /// Called by the worker loop right before the first and every later resume
    pub(crate) fn prepare(&self, owner: &Arc<Coroutine>) {
        if let CoroutineContext::Thread(thread) = self {
            thread.bind_owner(owner);
        }
    }

    /// Run the coroutine until it suspends or finishes
    pub(crate) fn resume(&mut self) -> ResumeOutcome {
        match self {
            CoroutineContext::Native => fatal("native context cannot be resumed by a worker loop"),
            CoroutineContext::Fiber(fiber) => fiber.resume(),
            CoroutineContext::Thread(thread) => thread.resume(),
        }
    }

    /// Release native resources; fiber stacks go back to `pool`
    pub(crate) fn recycle(self, pool: &StackPool) {
        match self {
            CoroutineContext::Native => {}
            CoroutineContext::Fiber(fiber) => fiber.recycle(pool),
            CoroutineContext::Thread(thread) => thread.recycle(),
        }
    }
}

/// Lock-free handle a running coroutine uses to give control back
#[derive(Clone)]
pub(crate) enum Suspender {
    Native,
    Fiber(Arc<YielderSlot>),
    Thread(Arc<Baton>),
}

impl Suspender {
    pub(crate) fn suspend(&self) {
        match self {
            Suspender::Native => fatal("native coroutines suspend through their worker loop"),
            Suspender::Fiber(slot) => slot.suspend(),
            Suspender::Thread(baton) => baton.suspend(),
        }
    }
}
