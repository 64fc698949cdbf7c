//! Raya Coroutine Runtime
//!
//! This crate provides the stackful coroutine scheduler used by the Raya VM:
//! - M:N scheduling of coroutines onto a bounded pool of worker threads
//! - Priority-ordered ready queues with FIFO or LIFO order per level
//! - Event-based blocking and waking
//! - Load balancing by migration between workers
//! - Detection and off-loading of blocked workers
//!
//! Coroutines run on user-space fibers or, optionally, on dedicated OS
//! threads handing a baton back and forth with their worker.

#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod coroutine;
pub mod error;
pub mod event;
pub mod id_allocator;
pub mod manager;
pub mod monitor;
pub mod priority_queue;
pub mod stats;
pub mod switch_guard;
pub mod worker;

pub use config::{ContextKind, OrderTable, SchedulerConfig};
pub use context::{CoroutineContext, StackPool};
pub use coroutine::{
    current, Coroutine, CoroutineFactory, CoroutineId, CoroutineRequest, CoroutineStatus,
    CoroutineType, DefaultCoroutineFactory, Entrypoint, EntrypointKind, ManagedEntrypoint,
    NativeEntrypoint, NativeFunction,
};
pub use error::{fatal, CoroError, UncaughtError};
pub use event::{CoroutineEvent, EventGuard, EventId};
pub use id_allocator::CoroutineIdAllocator;
pub use manager::{CoroutineManager, LaunchMode};
pub use monitor::BlockedWorkerMonitor;
pub use priority_queue::{CoroutinePriority, OrderDiscipline, PriorityQueue};
pub use stats::SchedulerStats;
pub use switch_guard::SwitchDisabledGuard;
pub use worker::{AffinityMask, Callback, CallbackPoster, Offload, Worker, WorkerId, WorkerKind};

/// Result type for fallible runtime operations
pub type CoroResult<T> = Result<T, CoroError>;
