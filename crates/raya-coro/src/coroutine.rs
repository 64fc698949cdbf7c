//! Coroutine structure and status
//!
//! A [`Coroutine`] is the managed half of a coroutine: identity, status,
//! priority, affinity and what it runs. The native half (stack and saved
//! registers) is its [`CoroutineContext`].

use crate::context::{CoroutineContext, Suspender};
use crate::error::{fatal, UncaughtError};
use crate::event::{CoroutineEvent, EventGuard};
use crate::priority_queue::CoroutinePriority;
use crate::worker::{AffinityMask, WorkerId};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Unique identifier for a Coroutine within the id space
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroutineId(u32);

impl CoroutineId {
    pub fn from_u32(id: u32) -> Self {
        CoroutineId(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coro#{}", self.0)
    }
}

/// Status of a Coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroutineStatus {
    /// Instantiated, not yet registered with a worker
    Created,
    /// In a ready queue
    Runnable,
    /// Executing on a worker
    Running,
    /// Waiting for an event
    Blocked,
    /// Entrypoint returned, waiting to be destroyed
    Terminating,
    /// Main coroutine waiting for every other coroutine to finish
    AwaitLoop,
}

impl CoroutineStatus {
    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(self, next: CoroutineStatus) -> bool {
        use CoroutineStatus::*;
        matches!(
            (self, next),
            (Created, Runnable)
                | (Runnable, Running)
                | (Running, Runnable)
                | (Running, Blocked)
                | (Running, Terminating)
                | (Running, AwaitLoop)
                | (Blocked, Runnable)
                | (AwaitLoop, Running)
                | (AwaitLoop, Blocked)
                | (AwaitLoop, Terminating)
        )
    }
}

/// Kind of coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoroutineType {
    /// Ordinary coroutine running user code; the only migratable kind
    Mutator,
    /// Pseudo-coroutine representing a worker thread's scheduling loop
    Schedule,
}

/// Function run by a native entrypoint
pub type NativeFunction = fn(usize);

/// Body of a managed entrypoint. Arguments are captured by the closure.
pub type ManagedMethod = Box<dyn FnOnce() -> Result<(), UncaughtError> + Send + 'static>;

/// Managed call: runs a method and fires a completion event afterwards
pub struct ManagedEntrypoint {
    /// Fired once the coroutine has been destroyed
    pub completion_event: Option<CoroutineEvent>,
    pub method: ManagedMethod,
}

impl ManagedEntrypoint {
    pub fn new<F>(method: F) -> Self
    where
        F: FnOnce() -> Result<(), UncaughtError> + Send + 'static,
    {
        Self {
            completion_event: None,
            method: Box::new(method),
        }
    }

    /// Attach a completion event
    pub fn with_completion_event(mut self, event: CoroutineEvent) -> Self {
        self.completion_event = Some(event);
        self
    }
}

/// Native call: a plain function and an opaque parameter
#[derive(Debug, Clone, Copy)]
pub struct NativeEntrypoint {
    pub function: NativeFunction,
    pub param: usize,
}

/// What a coroutine runs
pub enum Entrypoint {
    Managed(ManagedEntrypoint),
    Native(NativeEntrypoint),
    /// Runs on the stack of the OS thread that created it
    None,
}

impl Entrypoint {
    /// Managed entrypoint from a closure, without completion event
    pub fn managed<F>(method: F) -> Self
    where
        F: FnOnce() -> Result<(), UncaughtError> + Send + 'static,
    {
        Entrypoint::Managed(ManagedEntrypoint::new(method))
    }

    /// Native entrypoint from a function pointer and parameter
    pub fn native(function: NativeFunction, param: usize) -> Self {
        Entrypoint::Native(NativeEntrypoint { function, param })
    }

    pub fn kind(&self) -> EntrypointKind {
        match self {
            Entrypoint::Managed(_) => EntrypointKind::Managed,
            Entrypoint::Native(_) => EntrypointKind::Native,
            Entrypoint::None => EntrypointKind::None,
        }
    }
}

impl fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entrypoint::{:?}", self.kind())
    }
}

/// Entrypoint discriminant kept on the coroutine for introspection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntrypointKind {
    Managed,
    Native,
    None,
}

/// What a suspending coroutine asks its worker loop to do once control is back
pub(crate) enum SwitchRequest {
    /// Re-enqueue as runnable
    Yield,
    /// Register as waiter, then release the event lock
    Block(EventGuard),
    /// Re-enqueue as runnable and switch straight into `target`
    LaunchImmediately(CoroutineId),
}

/// Everything a [`CoroutineFactory`] needs to build a coroutine
pub struct CoroutineRequest {
    pub id: CoroutineId,
    pub name: String,
    pub(crate) context: CoroutineContext,
    pub entrypoint_kind: EntrypointKind,
    pub completion_event: Option<CoroutineEvent>,
    pub coro_type: CoroutineType,
    pub priority: CoroutinePriority,
    pub affinity: AffinityMask,
}

/// Builds coroutines for the manager; lets an embedder attach its own data
pub trait CoroutineFactory: Send + Sync {
    fn create(&self, request: CoroutineRequest) -> Coroutine;
}

/// Factory producing plain coroutines
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCoroutineFactory;

impl CoroutineFactory for DefaultCoroutineFactory {
    fn create(&self, request: CoroutineRequest) -> Coroutine {
        Coroutine::from_request(request)
    }
}

const NO_WORKER: usize = usize::MAX;

/// A cooperatively scheduled unit of execution
pub struct Coroutine {
    id: CoroutineId,
    name: String,
    coro_type: CoroutineType,
    priority: CoroutinePriority,
    affinity: AffinityMask,
    entrypoint_kind: EntrypointKind,
    status: Mutex<CoroutineStatus>,
    worker: AtomicUsize,
    context: Mutex<CoroutineContext>,
    suspender: Suspender,
    completion_event: Mutex<Option<CoroutineEvent>>,
    request: Mutex<Option<SwitchRequest>>,
    extension: Option<Box<dyn Any + Send + Sync>>,
}

impl Coroutine {
    /// Build a coroutine from a factory request
    pub fn from_request(request: CoroutineRequest) -> Self {
        let suspender = request.context.suspender();
        Self {
            id: request.id,
            name: request.name,
            coro_type: request.coro_type,
            priority: request.priority,
            affinity: request.affinity,
            entrypoint_kind: request.entrypoint_kind,
            status: Mutex::new(CoroutineStatus::Created),
            worker: AtomicUsize::new(NO_WORKER),
            context: Mutex::new(request.context),
            suspender,
            completion_event: Mutex::new(request.completion_event),
            request: Mutex::new(None),
            extension: None,
        }
    }

    /// Attach embedder data
    pub fn with_extension(mut self, extension: Box<dyn Any + Send + Sync>) -> Self {
        self.extension = Some(extension);
        self
    }

    /// Embedder data, if it has type `T`
    pub fn extension<T: Any>(&self) -> Option<&T> {
        self.extension.as_ref().and_then(|ext| ext.downcast_ref::<T>())
    }

    pub fn id(&self) -> CoroutineId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coro_type(&self) -> CoroutineType {
        self.coro_type
    }

    pub fn priority(&self) -> CoroutinePriority {
        self.priority
    }

    pub fn affinity(&self) -> AffinityMask {
        self.affinity
    }

    pub fn entrypoint_kind(&self) -> EntrypointKind {
        self.entrypoint_kind
    }

    /// Runs on its creating thread's stack rather than its own
    pub fn is_native(&self) -> bool {
        self.entrypoint_kind == EntrypointKind::None
    }

    pub fn status(&self) -> CoroutineStatus {
        *self.status.lock()
    }

    /// Move to `next`. An illegal transition is a contract violation.
    pub(crate) fn set_status(&self, next: CoroutineStatus) {
        let mut status = self.status.lock();
        if !status.can_transition_to(next) {
            let message = format!(
                "illegal status transition {:?} -> {:?} for {}",
                *status, next, self.id
            );
            drop(status);
            fatal(&message);
        }
        *status = next;
    }

    /// Worker currently owning this coroutine
    pub fn worker(&self) -> Option<WorkerId> {
        match self.worker.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(WorkerId::from_usize(id)),
        }
    }

    pub(crate) fn set_worker(&self, worker: Option<WorkerId>) {
        let raw = worker.map(WorkerId::as_usize).unwrap_or(NO_WORKER);
        self.worker.store(raw, Ordering::Release);
    }

    pub(crate) fn context(&self) -> &Mutex<CoroutineContext> {
        &self.context
    }

    pub(crate) fn suspender(&self) -> &Suspender {
        &self.suspender
    }

    pub(crate) fn take_completion_event(&self) -> Option<CoroutineEvent> {
        self.completion_event.lock().take()
    }

    pub(crate) fn set_request(&self, request: SwitchRequest) {
        let previous = self.request.lock().replace(request);
        if previous.is_some() {
            fatal(&format!("{} suspended with a pending switch request", self.id));
        }
    }

    pub(crate) fn take_request(&self) -> Option<SwitchRequest> {
        self.request.lock().take()
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.coro_type)
            .field("status", &self.status())
            .field("priority", &self.priority)
            .field("worker", &self.worker())
            .finish()
    }
}

/// Arena of live coroutines, keyed by id
#[derive(Default)]
pub struct CoroutineTable {
    coroutines: RwLock<FxHashMap<CoroutineId, Arc<Coroutine>>>,
}

impl CoroutineTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, coroutine: Arc<Coroutine>) {
        self.coroutines.write().insert(coroutine.id(), coroutine);
    }

    pub fn get(&self, id: CoroutineId) -> Option<Arc<Coroutine>> {
        self.coroutines.read().get(&id).cloned()
    }

    pub fn remove(&self, id: CoroutineId) -> Option<Arc<Coroutine>> {
        self.coroutines.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.coroutines.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coroutines.read().is_empty()
    }

    /// Remove and return everything left in the table
    pub(crate) fn drain(&self) -> Vec<Arc<Coroutine>> {
        self.coroutines.write().drain().map(|(_, coro)| coro).collect()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Coroutine>>> = const { RefCell::new(None) };
}

/// Coroutine running on the calling thread, if any.
///
/// Never inlined: a fiber may resume on a different OS thread, so the
/// thread-local must be looked up afresh on every call.
#[inline(never)]
pub fn current() -> Option<Arc<Coroutine>> {
    CURRENT.with(|current| current.borrow().clone())
}

#[inline(never)]
pub(crate) fn set_current(coroutine: Option<Arc<Coroutine>>) -> Option<Arc<Coroutine>> {
    CURRENT.with(|current| std::mem::replace(&mut *current.borrow_mut(), coroutine))
}

#[cfg(test)]
pub(crate) fn test_coroutine(id: u32, priority: CoroutinePriority, affinity: AffinityMask) -> Arc<Coroutine> {
    Arc::new(Coroutine::from_request(CoroutineRequest {
        id: CoroutineId::from_u32(id),
        name: format!("test-{}", id),
        context: CoroutineContext::Native,
        entrypoint_kind: EntrypointKind::Managed,
        completion_event: None,
        coro_type: CoroutineType::Mutator,
        priority,
        affinity,
    }))
}
