//! Workers: one scheduling loop per OS thread
//!
//! A worker owns a priority-ordered ready queue, a table of coroutines
//! blocked on events, and a queue of callbacks posted from other threads.
//! Its loop pops the best ready coroutine, switches into it, and acts on the
//! request the coroutine left behind when control comes back.
//!
//! Lock order inside a worker is ready queue, then waiters. When two
//! workers' ready queues are held at once (migration) they are locked by
//! ascending worker id.

use crate::config::SchedulerConfig;
use crate::context::ResumeOutcome;
use crate::coroutine::{
    set_current, Coroutine, CoroutineId, CoroutineStatus, CoroutineTable, CoroutineType,
    SwitchRequest,
};
use crate::error::fatal;
use crate::event::EventId;
use crate::manager::CoroutineManager;
use crate::priority_queue::{CoroutinePriority, PriorityQueue};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Index of a worker in the manager's registry; also its affinity bit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn from_usize(id: usize) -> Self {
        WorkerId(id)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Set of workers a coroutine may run on, one bit per [`WorkerId`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AffinityMask(u64);

impl AffinityMask {
    /// Any non-exclusive worker
    pub const FULL: AffinityMask = AffinityMask(u64::MAX);

    pub const EMPTY: AffinityMask = AffinityMask(0);

    /// Pinned to one worker
    pub fn single(worker: WorkerId) -> Self {
        let mut mask = Self::EMPTY;
        mask.insert(worker);
        mask
    }

    pub fn from_bits(bits: u64) -> Self {
        AffinityMask(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, worker: WorkerId) -> bool {
        worker.0 < u64::BITS as usize && self.0 & (1 << worker.0) != 0
    }

    pub fn insert(&mut self, worker: WorkerId) {
        if worker.0 < u64::BITS as usize {
            self.0 |= 1 << worker.0;
        }
    }

    pub fn remove(&mut self, worker: WorkerId) {
        if worker.0 < u64::BITS as usize {
            self.0 &= !(1 << worker.0);
        }
    }
}

/// Role of a worker
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    /// Bound to the thread that created the main coroutine
    Main,
    /// Pool worker with its own thread
    Common,
    /// Runs only coroutines pinned to it. `dedicated` workers own their
    /// thread and go away once drained; the others are bound to an external
    /// thread for its lifetime.
    Exclusive { dedicated: bool },
}

/// Callback run on a worker's thread inside its loop
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Posts callbacks to be run on a specific worker's thread
pub trait CallbackPoster: Send + Sync {
    /// Queue `callback`. Returns false if the worker no longer exists.
    fn post(&self, callback: Callback) -> bool;
}

pub(crate) struct WorkerCallbackPoster {
    worker: Weak<Worker>,
}

impl WorkerCallbackPoster {
    pub(crate) fn new(worker: &Arc<Worker>) -> Self {
        Self {
            worker: Arc::downgrade(worker),
        }
    }
}

impl CallbackPoster for WorkerCallbackPoster {
    fn post(&self, callback: Callback) -> bool {
        match self.worker.upgrade() {
            Some(worker) => worker.post(callback),
            None => false,
        }
    }
}

/// What the ready queue stores for each runnable coroutine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ReadyEntry {
    pub(crate) id: CoroutineId,
    pub(crate) affinity: AffinityMask,
    pub(crate) coro_type: CoroutineType,
}

impl ReadyEntry {
    fn of(coro: &Coroutine) -> Self {
        Self {
            id: coro.id(),
            affinity: coro.affinity(),
            coro_type: coro.coro_type(),
        }
    }
}

struct RunQueue {
    queue: PriorityQueue<ReadyEntry>,
    /// Exponential moving average of the queue depth
    load_factor: f64,
    /// Cleared when the worker retires
    accepting: bool,
}

impl RunQueue {
    fn sample(&mut self, alpha: f64) {
        self.load_factor = alpha * self.queue.len() as f64 + (1.0 - alpha) * self.load_factor;
    }
}

/// What an outward migration did
#[derive(Debug, Default)]
pub struct Offload {
    /// Coroutines now queued on a peer
    pub moved: usize,
    /// Coroutines no peer took that could not go back either, because this
    /// worker retired meanwhile. Still assigned to it.
    pub stranded: Vec<Arc<Coroutine>>,
}

enum Next {
    Run(CoroutineId),
    Callbacks,
    Exit,
}

const NOT_RUNNING: u32 = 0;

/// A scheduling loop with its local queues
pub struct Worker {
    /// Slot in the manager's worker table, also the affinity bit
    id: WorkerId,
    /// Main, common or exclusive
    kind: WorkerKind,
    /// Thread name, also used in logs
    name: String,
    /// Smoothing factor for `load_factor`
    alpha: f64,
    /// How long an idle loop sleeps before looking for work elsewhere
    idle_wait: Duration,
    /// Whether an idle loop may steal from busier peers
    migration_enabled: bool,
    /// Base for the nanosecond timestamps below
    epoch: Instant,

    /// Ready coroutines plus retirement flag
    runnables: Mutex<RunQueue>,
    /// Signalled on push, post and deactivation
    runnables_cv: Condvar,
    /// Blocked coroutines keyed by the event they wait on
    waiters: Mutex<FxHashMap<EventId, CoroutineId>>,
    /// Terminated coroutines to destroy once off their stacks
    finalization: Mutex<Vec<CoroutineId>>,
    /// Callbacks posted from other threads
    posted: Mutex<VecDeque<Callback>>,

    /// Cleared to stop the loop once drained
    active: AtomicBool,
    /// Coroutines whose `worker()` is this worker, excluding its scheduler
    assigned: AtomicUsize,
    /// Raw id of the coroutine on this worker right now, or `NOT_RUNNING`
    running: AtomicU32,
    /// Nanoseconds since `epoch` of the last switch in or out
    last_switch: AtomicU64,
    /// Set while the running coroutine is inside a native call
    in_native_call: AtomicBool,
    /// Nanoseconds since `epoch` when the current native call began
    native_call_since: AtomicU64,
    /// Nesting depth of switch-disabled sections
    switch_disabled: AtomicU32,
    /// Context switches performed by this loop
    switch_count: AtomicU64,
}

impl Worker {
    pub fn new(id: WorkerId, kind: WorkerKind, config: &SchedulerConfig, epoch: Instant) -> Self {
        let name = match kind {
            WorkerKind::Main => "raya-coro-main".to_string(),
            WorkerKind::Common => format!("raya-coro-worker-{}", id.0),
            WorkerKind::Exclusive { .. } => format!("raya-coro-exclusive-{}", id.0),
        };
        Self {
            id,
            kind,
            name,
            alpha: config.load_factor_alpha,
            idle_wait: config.idle_wait(),
            migration_enabled: config.migration_enabled,
            epoch,
            runnables: Mutex::new(RunQueue {
                queue: PriorityQueue::new(config.order.as_array()),
                load_factor: 0.0,
                accepting: true,
            }),
            runnables_cv: Condvar::new(),
            waiters: Mutex::new(FxHashMap::default()),
            finalization: Mutex::new(Vec::new()),
            posted: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(true),
            assigned: AtomicUsize::new(0),
            running: AtomicU32::new(NOT_RUNNING),
            last_switch: AtomicU64::new(0),
            in_native_call: AtomicBool::new(false),
            native_call_since: AtomicU64::new(0),
            switch_disabled: AtomicU32::new(0),
            switch_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_main(&self) -> bool {
        self.kind == WorkerKind::Main
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.kind, WorkerKind::Exclusive { .. })
    }

    pub fn is_dedicated(&self) -> bool {
        self.kind == WorkerKind::Exclusive { dedicated: true }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ask the loop to stop once its queue is drained
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        let _rq = self.runnables.lock();
        self.runnables_cv.notify_all();
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Whether a coroutine with `affinity` may be queued here. Exclusive
    /// workers only take coroutines pinned to them alone.
    pub fn accepts(&self, affinity: AffinityMask) -> bool {
        match self.kind {
            WorkerKind::Exclusive { .. } => affinity == AffinityMask::single(self.id),
            _ => affinity.contains(self.id),
        }
    }

    pub fn assigned(&self) -> usize {
        self.assigned.load(Ordering::Acquire)
    }

    pub(crate) fn adopt(&self) {
        self.assigned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) {
        let underflow = self
            .assigned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err();
        if underflow {
            tracing::warn!(worker = %self.id, "released a coroutine this worker did not own");
        }
    }

    /// Take ownership of a coroutine that will be run directly, without
    /// passing through the ready queue
    pub(crate) fn claim(&self, coro: &Coroutine) {
        self.adopt();
        coro.set_worker(Some(self.id));
    }

    /// Queue a runnable coroutine. Returns false once the worker retired.
    pub(crate) fn push_runnable(&self, coro: &Coroutine) -> bool {
        let mut rq = self.runnables.lock();
        if !rq.accepting {
            return false;
        }
        coro.set_worker(Some(self.id));
        rq.queue.push(ReadyEntry::of(coro), coro.priority());
        rq.sample(self.alpha);
        self.runnables_cv.notify_one();
        true
    }

    /// Put back an entry taken out for migration. False once the worker
    /// retired; the caller then has to place the coroutine elsewhere.
    fn restore_entry(&self, entry: ReadyEntry, priority: CoroutinePriority) -> bool {
        let mut rq = self.runnables.lock();
        if !rq.accepting {
            return false;
        }
        rq.queue.push(entry, priority);
        rq.sample(self.alpha);
        self.runnables_cv.notify_one();
        true
    }

    pub fn ready_len(&self) -> usize {
        self.runnables.lock().queue.len()
    }

    /// Ready coroutines plus the one currently running, if any
    pub fn load(&self) -> usize {
        let running = self.running.load(Ordering::Acquire) != NOT_RUNNING;
        self.ready_len() + running as usize
    }

    pub fn load_factor(&self) -> f64 {
        self.runnables.lock().load_factor
    }

    /// Lightest first: current load, then the smoothed queue depth, then id
    pub fn cmp_load(&self, other: &Worker) -> std::cmp::Ordering {
        self.load()
            .cmp(&other.load())
            .then_with(|| self.load_factor().total_cmp(&other.load_factor()))
            .then_with(|| self.id.cmp(&other.id))
    }

    /// Ids of ready coroutines, best first
    pub fn ready_ids(&self) -> Vec<CoroutineId> {
        let rq = self.runnables.lock();
        rq.queue.to_sorted_vec().into_iter().map(|entry| entry.id).collect()
    }

    pub fn running(&self) -> Option<CoroutineId> {
        match self.running.load(Ordering::Acquire) {
            NOT_RUNNING => None,
            id => Some(CoroutineId::from_u32(id)),
        }
    }

    pub fn switch_count(&self) -> u64 {
        self.switch_count.load(Ordering::Relaxed)
    }

    // ---- waiters ----

    /// Record `id` as the waiter of `event`. At most one waiter per event.
    pub(crate) fn register_waiter(&self, event: EventId, id: CoroutineId) {
        let previous = self.waiters.lock().insert(event, id);
        if let Some(previous) = previous {
            fatal(&format!(
                "{} already has waiter {} on {}; {} cannot wait too",
                event, previous, self.id, id
            ));
        }
    }

    pub(crate) fn take_waiter(&self, event: EventId) -> Option<CoroutineId> {
        self.waiters.lock().remove(&event)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub(crate) fn take_all_waiters(&self) -> FxHashMap<EventId, CoroutineId> {
        std::mem::take(&mut *self.waiters.lock())
    }

    pub(crate) fn adopt_waiters(&self, waiters: FxHashMap<EventId, CoroutineId>) {
        self.waiters.lock().extend(waiters);
    }

    // ---- retirement ----

    /// Stop accepting work and hand back everything still queued, ordered
    /// so that requeueing one by one keeps each level's order
    pub(crate) fn close_queue(&self) -> Vec<(ReadyEntry, CoroutinePriority)> {
        let mut rq = self.runnables.lock();
        rq.accepting = false;
        let len = rq.queue.len();
        let drained = rq.queue.remove_subset(|_| true, len);
        rq.sample(self.alpha);
        rq.queue.reinsertion_order(drained)
    }

    // ---- migration ----

    /// Pull up to half of `source`'s eligible ready coroutines into this
    /// (idle) worker. Returns how many moved.
    pub fn migrate_from(&self, source: &Worker, table: &CoroutineTable) -> usize {
        if source.id == self.id {
            tracing::debug!(worker = %self.id, "migration from self ignored");
            return 0;
        }

        let (mut mine, mut theirs) = lock_pair(self, source);
        if !mine.accepting || !mine.queue.is_empty() {
            return 0;
        }
        let limit = theirs.queue.len() / 2;
        if limit == 0 {
            return 0;
        }

        let moved = theirs.queue.remove_subset(
            |entry| entry.coro_type == CoroutineType::Mutator && self.accepts(entry.affinity),
            limit,
        );
        theirs.sample(source.alpha);

        let count = moved.len();
        for (entry, _) in &moved {
            if let Some(coro) = table.get(entry.id) {
                coro.set_worker(Some(self.id));
            }
            source.release();
            self.adopt();
        }
        mine.queue.extend_ordered(moved);
        mine.sample(self.alpha);
        drop(theirs);
        drop(mine);

        if count > 0 {
            self.runnables_cv.notify_all();
            tracing::debug!(from = %source.id, to = %self.id, count, "migrated coroutines");
        }
        count
    }

    /// Push half (rounded up) of this worker's eligible ready coroutines to
    /// the least-loaded accepting peers.
    pub fn migrate_coroutines_outward(&self, peers: &[Arc<Worker>], table: &CoroutineTable) -> Offload {
        let mut outcome = Offload::default();
        let targets: Vec<&Arc<Worker>> = peers
            .iter()
            .filter(|peer| peer.id != self.id && peer.is_active() && !peer.is_exclusive())
            .collect();
        if targets.is_empty() {
            return outcome;
        }

        let taken = {
            let mut rq = self.runnables.lock();
            let limit = rq.queue.len().div_ceil(2);
            let taken = rq.queue.remove_subset(
                |entry| {
                    entry.coro_type == CoroutineType::Mutator
                        && targets.iter().any(|peer| peer.accepts(entry.affinity))
                },
                limit,
            );
            rq.sample(self.alpha);
            rq.queue.reinsertion_order(taken)
        };

        for (entry, priority) in taken {
            let target = targets
                .iter()
                .filter(|peer| peer.accepts(entry.affinity))
                .min_by(|a, b| a.cmp_load(b));
            let Some(coro) = table.get(entry.id) else {
                tracing::debug!(coroutine = %entry.id, "queued coroutine vanished during migration");
                continue;
            };
            if let Some(target) = target {
                target.adopt();
                if target.push_runnable(&coro) {
                    self.release();
                    outcome.moved += 1;
                    continue;
                }
                target.release();
            }
            if !self.restore_entry(entry, priority) {
                outcome.stranded.push(coro);
            }
        }

        if outcome.moved > 0 {
            tracing::debug!(from = %self.id, count = outcome.moved, "off-loaded coroutines");
        }
        outcome
    }

    /// A worker looks stuck when it has ready work but has not switched for
    /// longer than `threshold`, or has been inside a native call that long.
    pub fn is_potentially_blocked(&self, threshold: Duration) -> bool {
        if !self.is_active() || self.ready_len() == 0 {
            return false;
        }
        let now = self.now();
        let limit = threshold.as_nanos() as u64;
        if self.in_native_call.load(Ordering::Acquire) {
            let since = self.native_call_since.load(Ordering::Acquire);
            if now.saturating_sub(since) > limit {
                return true;
            }
        }
        self.running().is_some()
            && now.saturating_sub(self.last_switch.load(Ordering::Acquire)) > limit
    }

    // ---- hooks ----

    pub fn on_coro_became_active(&self, coro: &Coroutine) {
        self.running.store(coro.id().as_u32(), Ordering::Release);
        self.last_switch.store(self.now(), Ordering::Release);
        tracing::trace!(worker = %self.id, coroutine = %coro.id(), "switch in");
    }

    pub fn on_coro_became_non_active(&self, coro: &Coroutine) {
        self.running.store(NOT_RUNNING, Ordering::Release);
        self.last_switch.store(self.now(), Ordering::Release);
        self.switch_count.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(worker = %self.id, coroutine = %coro.id(), "switch out");
    }

    /// The running coroutine enters code that may block its OS thread
    pub fn on_native_call_enter(&self) {
        self.native_call_since.store(self.now(), Ordering::Release);
        self.in_native_call.store(true, Ordering::Release);
    }

    pub fn on_native_call_exit(&self) {
        self.in_native_call.store(false, Ordering::Release);
    }

    pub fn is_in_native_call(&self) -> bool {
        self.in_native_call.load(Ordering::Acquire)
    }

    pub(crate) fn disable_switch(&self) {
        self.switch_disabled.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn enable_switch(&self) {
        let underflow = self
            .switch_disabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err();
        if underflow {
            tracing::warn!(worker = %self.id, "switch enabled without a matching disable");
        }
    }

    pub fn is_switch_disabled(&self) -> bool {
        self.switch_disabled.load(Ordering::Acquire) > 0
    }

    // ---- posted callbacks ----

    /// Queue a callback for this worker's loop. False once retired.
    pub fn post(&self, callback: Callback) -> bool {
        let rq = self.runnables.lock();
        if !rq.accepting {
            return false;
        }
        self.posted.lock().push_back(callback);
        self.runnables_cv.notify_one();
        true
    }

    pub(crate) fn run_posted_callbacks(&self) -> usize {
        let callbacks = std::mem::take(&mut *self.posted.lock());
        let count = callbacks.len();
        for callback in callbacks {
            callback();
        }
        count
    }

    // ---- scheduling loop ----

    /// Run the loop until there is nothing left to do.
    ///
    /// With `native` set, the loop is running on that coroutine's own stack
    /// (it just suspended) and returns as soon as the native coroutine is
    /// picked again. Without it, the loop owns the thread and returns once
    /// the worker is deactivated and drained.
    pub(crate) fn schedule_loop(
        &self,
        manager: &CoroutineManager,
        native: Option<&Arc<Coroutine>>,
        mut hint: Option<CoroutineId>,
    ) {
        loop {
            self.run_posted_callbacks();
            self.finalize_terminated(manager);

            let id = match hint.take() {
                Some(id) => id,
                None => match self.next_ready(manager, native.is_some()) {
                    Next::Run(id) => id,
                    Next::Callbacks => continue,
                    Next::Exit => {
                        self.finalize_terminated(manager);
                        return;
                    }
                },
            };

            if let Some(native) = native {
                if native.id() == id {
                    native.set_status(CoroutineStatus::Running);
                    self.on_coro_became_active(native);
                    return;
                }
            }

            let Some(coro) = manager.coroutine(id) else {
                fatal(&format!("{} scheduled unknown {}", self.id, id));
            };
            hint = self.switch_into(manager, &coro);
        }
    }

    fn next_ready(&self, manager: &CoroutineManager, has_native: bool) -> Next {
        loop {
            let timed_out = {
                let mut rq = self.runnables.lock();
                if let Some(entry) = rq.queue.pop() {
                    rq.sample(self.alpha);
                    return Next::Run(entry.id);
                }
                if !has_native && !self.is_active() {
                    return Next::Exit;
                }
                if !self.posted.lock().is_empty() {
                    return Next::Callbacks;
                }
                self.runnables_cv
                    .wait_for(&mut rq, self.idle_wait)
                    .timed_out()
            };

            if timed_out && self.kind == WorkerKind::Common && self.migration_enabled {
                manager.request_work(self);
            }
        }
    }

    /// Resume `coro` and handle whatever it asked for on the way out.
    /// Returns a coroutine to switch to next, bypassing the queue.
    fn switch_into(&self, manager: &CoroutineManager, coro: &Arc<Coroutine>) -> Option<CoroutineId> {
        coro.set_status(CoroutineStatus::Running);
        self.on_coro_became_active(coro);
        manager.stats_counters().record_switch();

        let previous = set_current(Some(coro.clone()));
        let outcome = {
            let mut context = coro.context().lock();
            context.prepare(coro);
            context.resume()
        };
        set_current(previous);
        self.on_coro_became_non_active(coro);

        match outcome {
            ResumeOutcome::Finished => {
                coro.set_status(CoroutineStatus::Terminating);
                self.finalization.lock().push(coro.id());
                None
            }
            ResumeOutcome::Suspended => match coro.take_request() {
                Some(request) => self.process_request(manager, coro, request),
                None => fatal(&format!("{} suspended without a switch request", coro.id())),
            },
        }
    }

    /// Act on a suspended coroutine's request. Runs on this worker's thread
    /// after the coroutine is off its stack.
    pub(crate) fn process_request(
        &self,
        manager: &CoroutineManager,
        coro: &Arc<Coroutine>,
        request: SwitchRequest,
    ) -> Option<CoroutineId> {
        match request {
            SwitchRequest::Yield => {
                coro.set_status(CoroutineStatus::Runnable);
                manager.requeue(coro, self);
                None
            }
            SwitchRequest::Block(guard) => {
                coro.set_status(CoroutineStatus::Blocked);
                self.register_waiter(guard.event_id(), coro.id());
                drop(guard);
                None
            }
            SwitchRequest::LaunchImmediately(target) => {
                coro.set_status(CoroutineStatus::Runnable);
                manager.requeue(coro, self);
                Some(target)
            }
        }
    }

    fn finalize_terminated(&self, manager: &CoroutineManager) {
        let terminated = std::mem::take(&mut *self.finalization.lock());
        for id in terminated {
            manager.destroy_coroutine(id);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .field("ready", &self.ready_len())
            .field("assigned", &self.assigned())
            .finish()
    }
}

/// Lock two ready queues by ascending worker id; guards come back as (a, b)
fn lock_pair<'a>(a: &'a Worker, b: &'a Worker) -> (MutexGuard<'a, RunQueue>, MutexGuard<'a, RunQueue>) {
    if a.id < b.id {
        let first = a.runnables.lock();
        let second = b.runnables.lock();
        (first, second)
    } else {
        let first = b.runnables.lock();
        let second = a.runnables.lock();
        (second, first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coroutine::test_coroutine;
    use crate::priority_queue::OrderDiscipline;

    fn worker(id: usize, kind: WorkerKind) -> Arc<Worker> {
        Arc::new(Worker::new(
            WorkerId::from_usize(id),
            kind,
            &SchedulerConfig::default(),
            Instant::now(),
        ))
    }

    fn queue_on(worker: &Worker, table: &CoroutineTable, id: u32, affinity: AffinityMask) -> Arc<Coroutine> {
        let coro = test_coroutine(id, CoroutinePriority::Medium, affinity);
        table.insert(coro.clone());
        worker.adopt();
        assert!(worker.push_runnable(&coro));
        coro
    }

    #[test]
    fn test_affinity_mask() {
        let w3 = WorkerId::from_usize(3);
        let mut mask = AffinityMask::single(w3);
        assert!(mask.contains(w3));
        assert!(!mask.contains(WorkerId::from_usize(2)));
        mask.insert(WorkerId::from_usize(2));
        assert_eq!(mask.bits(), 0b1100);
        mask.remove(w3);
        assert_eq!(mask.bits(), 0b0100);
        assert!(AffinityMask::FULL.contains(WorkerId::from_usize(63)));
        assert!(!AffinityMask::FULL.contains(WorkerId::from_usize(64)));
    }

    #[test]
    fn test_exclusive_accepts_only_pinned() {
        let exclusive = worker(5, WorkerKind::Exclusive { dedicated: true });
        assert!(!exclusive.accepts(AffinityMask::FULL));
        assert!(exclusive.accepts(AffinityMask::single(WorkerId::from_usize(5))));

        let common = worker(1, WorkerKind::Common);
        assert!(common.accepts(AffinityMask::FULL));
        assert!(!common.accepts(AffinityMask::single(WorkerId::from_usize(5))));
    }

    #[test]
    fn test_migrate_from_moves_half() {
        let table = CoroutineTable::new();
        let w1 = worker(1, WorkerKind::Common);
        let w2 = worker(2, WorkerKind::Common);
        for id in 1..=4 {
            queue_on(&w1, &table, id, AffinityMask::FULL);
        }

        let moved = w2.migrate_from(&w1, &table);
        assert_eq!(moved, 2);
        assert_eq!(w1.ready_len(), 2);
        assert_eq!(w2.ready_len(), 2);
        assert_eq!(w1.assigned(), 2);
        assert_eq!(w2.assigned(), 2);

        for id in w2.ready_ids() {
            let coro = table.get(id).unwrap();
            assert!(coro.affinity().contains(w2.id()));
            assert_eq!(coro.worker(), Some(w2.id()));
        }
    }

    fn ids(worker: &Worker) -> Vec<u32> {
        worker.ready_ids().into_iter().map(CoroutineId::as_u32).collect()
    }

    #[test]
    fn test_migration_keeps_stack_order() {
        let mut config = SchedulerConfig::default();
        config.order.medium = OrderDiscipline::Stack;
        let stacked = |id| Arc::new(Worker::new(WorkerId::from_usize(id), WorkerKind::Common, &config, Instant::now()));
        let table = CoroutineTable::new();
        let w1 = stacked(1);
        let w2 = stacked(2);
        for id in 1..=4 {
            queue_on(&w1, &table, id, AffinityMask::FULL);
        }
        assert_eq!(ids(&w1), vec![4, 3, 2, 1]);

        assert_eq!(w2.migrate_from(&w1, &table), 2);
        assert_eq!(ids(&w2), vec![4, 3]);
        assert_eq!(ids(&w1), vec![2, 1]);

        // Off-loading and retirement keep the order too
        let w3 = stacked(3);
        let peers = vec![w2.clone(), w3.clone()];
        assert_eq!(w2.migrate_coroutines_outward(&peers, &table).moved, 1);
        assert_eq!(ids(&w3), vec![4]);

        let drained: Vec<u32> = w1.close_queue().into_iter().map(|(entry, _)| entry.id.as_u32()).collect();
        assert_eq!(drained, vec![1, 2]);
    }

    #[test]
    fn test_migrate_from_respects_affinity() {
        let table = CoroutineTable::new();
        let w1 = worker(1, WorkerKind::Common);
        let w2 = worker(2, WorkerKind::Common);
        let pinned = AffinityMask::single(w1.id());
        for id in 1..=4 {
            queue_on(&w1, &table, id, pinned);
        }
        queue_on(&w1, &table, 5, AffinityMask::FULL);

        // Only one of the five is eligible; limit is two.
        assert_eq!(w2.migrate_from(&w1, &table), 1);
        assert_eq!(w2.ready_ids(), vec![CoroutineId::from_u32(5)]);
        assert_eq!(w1.ready_len(), 4);
    }

    #[test]
    fn test_migrate_from_requires_idle_target() {
        let table = CoroutineTable::new();
        let w1 = worker(1, WorkerKind::Common);
        let w2 = worker(2, WorkerKind::Common);
        for id in 1..=4 {
            queue_on(&w1, &table, id, AffinityMask::FULL);
        }
        queue_on(&w2, &table, 10, AffinityMask::FULL);

        assert_eq!(w2.migrate_from(&w1, &table), 0);
        assert_eq!(w1.migrate_from(&w1, &table), 0);
        assert_eq!(w1.ready_len(), 4);
    }

    #[test]
    fn test_migration_conserves_coroutines() {
        let table = CoroutineTable::new();
        let w0 = worker(0, WorkerKind::Common);
        let w1 = worker(1, WorkerKind::Common);
        let w2 = worker(2, WorkerKind::Common);
        for id in 1..=9 {
            queue_on(&w0, &table, id, AffinityMask::FULL);
        }

        let peers = vec![w0.clone(), w1.clone(), w2.clone()];
        let outcome = w0.migrate_coroutines_outward(&peers, &table);
        assert_eq!(outcome.moved, 5);
        assert!(outcome.stranded.is_empty());
        assert_eq!(w0.ready_len() + w1.ready_len() + w2.ready_len(), 9);
        assert_eq!(w1.ready_len(), 3);
        assert_eq!(w2.ready_len(), 2);
        assert_eq!(w0.assigned(), 4);

        let mut all: Vec<_> = [&w0, &w1, &w2]
            .iter()
            .flat_map(|w| w.ready_ids())
            .map(CoroutineId::as_u32)
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn test_outward_restores_when_peer_retired() {
        let table = CoroutineTable::new();
        let w0 = worker(0, WorkerKind::Common);
        let w1 = worker(1, WorkerKind::Common);
        for id in 1..=4 {
            queue_on(&w0, &table, id, AffinityMask::FULL);
        }
        w1.close_queue();

        let peers = vec![w0.clone(), w1.clone()];
        let outcome = w0.migrate_coroutines_outward(&peers, &table);
        assert_eq!(outcome.moved, 0);
        assert!(outcome.stranded.is_empty());
        assert_eq!(w0.ready_len(), 4);
        assert_eq!(w0.assigned(), 4);
        assert_eq!(w1.assigned(), 0);
    }

    #[test]
    fn test_restore_entry_refused_after_close() {
        let table = CoroutineTable::new();
        let w = worker(0, WorkerKind::Common);
        queue_on(&w, &table, 1, AffinityMask::FULL);

        let drained = w.close_queue();
        let (entry, priority) = drained[0];
        assert!(!w.restore_entry(entry, priority));
        assert_eq!(w.ready_len(), 0);
    }

    #[test]
    fn test_outward_skips_exclusive_peers() {
        let table = CoroutineTable::new();
        let w0 = worker(0, WorkerKind::Common);
        let ex = worker(1, WorkerKind::Exclusive { dedicated: true });
        for id in 1..=4 {
            queue_on(&w0, &table, id, AffinityMask::FULL);
        }
        let peers = vec![w0.clone(), ex.clone()];
        assert_eq!(w0.migrate_coroutines_outward(&peers, &table).moved, 0);
        assert_eq!(w0.ready_len(), 4);
    }

    #[test]
    fn test_ready_ids_follow_priority() {
        let table = CoroutineTable::new();
        let w = worker(0, WorkerKind::Common);
        for (id, priority) in [
            (1, CoroutinePriority::Low),
            (2, CoroutinePriority::High),
            (3, CoroutinePriority::Medium),
        ] {
            let coro = test_coroutine(id, priority, AffinityMask::FULL);
            table.insert(coro.clone());
            w.push_runnable(&coro);
        }
        let ids: Vec<u32> = w.ready_ids().into_iter().map(CoroutineId::as_u32).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_waiters_register_and_take() {
        let w = worker(0, WorkerKind::Common);
        let event = crate::event::CoroutineEvent::detached();
        w.register_waiter(event.id(), CoroutineId::from_u32(4));
        assert_eq!(w.waiter_count(), 1);
        assert_eq!(w.take_waiter(event.id()), Some(CoroutineId::from_u32(4)));
        assert_eq!(w.take_waiter(event.id()), None);
    }

    #[test]
    fn test_closed_queue_rejects_work() {
        let table = CoroutineTable::new();
        let w = worker(0, WorkerKind::Common);
        queue_on(&w, &table, 1, AffinityMask::FULL);

        let drained = w.close_queue();
        assert_eq!(drained.len(), 1);
        let late = test_coroutine(2, CoroutinePriority::Medium, AffinityMask::FULL);
        assert!(!w.push_runnable(&late));
        assert!(!w.post(Box::new(|| {})));
    }

    #[test]
    fn test_posted_callbacks_run_in_order() {
        let w = worker(0, WorkerKind::Common);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            assert!(w.post(Box::new(move || log.lock().push(i))));
        }
        assert_eq!(w.run_posted_callbacks(), 3);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(w.run_posted_callbacks(), 0);
    }

    #[test]
    fn test_poster_outlived_by_worker() {
        let w = worker(0, WorkerKind::Common);
        let poster = WorkerCallbackPoster::new(&w);
        assert!(poster.post(Box::new(|| {})));
        drop(w);
        assert!(!poster.post(Box::new(|| {})));
    }

    #[test]
    fn test_native_call_marks_worker_blocked() {
        let table = CoroutineTable::new();
        let w = worker(0, WorkerKind::Common);
        queue_on(&w, &table, 1, AffinityMask::FULL);
        assert!(!w.is_potentially_blocked(Duration::from_millis(1)));

        w.on_native_call_enter();
        std::thread::sleep(Duration::from_millis(5));
        assert!(w.is_potentially_blocked(Duration::from_millis(1)));
        w.on_native_call_exit();
        assert!(!w.is_in_native_call());
    }

    #[test]
    fn test_load_factor_tracks_depth() {
        let table = CoroutineTable::new();
        let w = worker(0, WorkerKind::Common);
        assert_eq!(w.load_factor(), 0.0);
        for id in 1..=4 {
            queue_on(&w, &table, id, AffinityMask::FULL);
        }
        assert!(w.load_factor() > 0.0);
        assert_eq!(w.load(), 4);
    }

    #[test]
    fn test_cmp_load_breaks_ties_by_load_factor() {
        let table = CoroutineTable::new();
        let w1 = worker(1, WorkerKind::Common);
        let w2 = worker(2, WorkerKind::Common);
        let w3 = worker(3, WorkerKind::Common);
        // w1 peaks at four before shedding two; w2 only ever held two
        for id in 1..=4 {
            queue_on(&w1, &table, id, AffinityMask::FULL);
        }
        assert_eq!(w3.migrate_from(&w1, &table), 2);
        for id in 5..=6 {
            queue_on(&w2, &table, id, AffinityMask::FULL);
        }

        assert_eq!(w1.load(), w2.load());
        assert!(w1.load_factor() > w2.load_factor());
        assert_eq!(w2.cmp_load(&w1), std::cmp::Ordering::Less);
        assert_eq!(w1.cmp_load(&w1), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_unbalanced_release_saturates() {
        let w = worker(0, WorkerKind::Common);
        w.release();
        assert_eq!(w.assigned(), 0);
        w.adopt();
        w.release();
        w.release();
        assert_eq!(w.assigned(), 0);

        w.enable_switch();
        assert!(!w.is_switch_disabled());
        w.disable_switch();
        w.enable_switch();
        w.enable_switch();
        assert!(!w.is_switch_disabled());
    }
}
