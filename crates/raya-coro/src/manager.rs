//! Coroutine manager coordinating workers and coroutines
//!
//! The manager owns the coroutine table, the worker registry and the id
//! space. It creates coroutines, places them on workers, wakes waiters, and
//! grows or shrinks the worker pool. Every worker loop calls back into it
//! for anything that spans more than one worker.
//!
//! The thread that calls [`CoroutineManager::create_main_coroutine`] becomes
//! the main worker; the main coroutine runs on that thread's own stack and
//! the main worker's loop runs there whenever the main coroutine suspends.

use crate::config::{ContextKind, SchedulerConfig};
use crate::context::{CoroutineBody, CoroutineContext, FiberContext, StackPool, ThreadContext};
use crate::coroutine::{
    self, Coroutine, CoroutineFactory, CoroutineId, CoroutineRequest, CoroutineStatus,
    CoroutineTable, CoroutineType, DefaultCoroutineFactory, Entrypoint, EntrypointKind,
    ManagedMethod, SwitchRequest,
};
use crate::error::{fatal, CoroError, UncaughtError};
use crate::event::{CoroutineEvent, EventGuard};
use crate::id_allocator::CoroutineIdAllocator;
use crate::monitor::BlockedWorkerMonitor;
use crate::priority_queue::CoroutinePriority;
use crate::stats::{SchedulerStats, StatsCounters};
use crate::switch_guard::SwitchDisabledGuard;
use crate::worker::{
    AffinityMask, CallbackPoster, Worker, WorkerCallbackPoster, WorkerId, WorkerKind,
};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cmp::Reverse;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Where a launched coroutine may run
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LaunchMode {
    /// Any non-exclusive worker, least loaded first
    #[default]
    Default,
    /// Pinned to the caller's worker (the main worker off-scheduler)
    SameWorker,
    /// Pinned to the main worker
    MainWorker,
    /// Pinned to a freshly spawned dedicated worker that exits once drained
    Exclusive,
}

/// Top-level scheduler
pub struct CoroutineManager {
    self_ref: Weak<CoroutineManager>,
    config: SchedulerConfig,
    factory: Arc<dyn CoroutineFactory>,
    epoch: Instant,

    coroutines: CoroutineTable,
    ids: Mutex<CoroutineIdAllocator>,

    /// Indexed by worker id
    workers: RwLock<Vec<Option<Arc<Worker>>>>,
    free_worker_ids: Mutex<Vec<usize>>,
    worker_threads: Mutex<FxHashMap<WorkerId, JoinHandle<()>>>,
    main_worker: OnceLock<Arc<Worker>>,
    main_coroutine: OnceLock<Arc<Coroutine>>,
    started: AtomicBool,
    finalized: AtomicBool,

    /// Launched coroutines not yet destroyed
    live_coroutines: AtomicUsize,
    exclusive_workers: AtomicUsize,

    stack_pool: StackPool,
    program_completion: CoroutineEvent,
    /// Held for writing while a retiring worker hands its waiters over
    waiter_transfer: RwLock<()>,
    monitor: Mutex<Option<BlockedWorkerMonitor>>,
    stats: Arc<StatsCounters>,
}

impl CoroutineManager {
    /// Create a manager. No threads are started until
    /// [`create_main_coroutine`](Self::create_main_coroutine).
    pub fn new(config: SchedulerConfig, factory: Arc<dyn CoroutineFactory>) -> Result<Arc<Self>, CoroError> {
        config.validate()?;

        let ids = CoroutineIdAllocator::new(config.coroutine_id_space);
        let stack_pool = StackPool::new(config.stack_pool_capacity, config.stack_size);
        let free_worker_ids = (0..config.max_workers).rev().collect();
        let workers = vec![None; config.max_workers];

        Ok(Arc::new_cyclic(|self_ref: &Weak<CoroutineManager>| Self {
            self_ref: self_ref.clone(),
            factory,
            epoch: Instant::now(),
            coroutines: CoroutineTable::new(),
            ids: Mutex::new(ids),
            workers: RwLock::new(workers),
            free_worker_ids: Mutex::new(free_worker_ids),
            worker_threads: Mutex::new(FxHashMap::default()),
            main_worker: OnceLock::new(),
            main_coroutine: OnceLock::new(),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            live_coroutines: AtomicUsize::new(0),
            exclusive_workers: AtomicUsize::new(0),
            stack_pool,
            program_completion: CoroutineEvent::with_manager(self_ref.clone()),
            waiter_transfer: RwLock::new(()),
            monitor: Mutex::new(None),
            stats: Arc::new(StatsCounters::default()),
            config,
        }))
    }

    /// Create a manager building plain coroutines
    pub fn with_default_factory(config: SchedulerConfig) -> Result<Arc<Self>, CoroError> {
        Self::new(config, Arc::new(DefaultCoroutineFactory))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn strong_self(&self) -> Arc<CoroutineManager> {
        match self.self_ref.upgrade() {
            Some(manager) => manager,
            None => fatal("coroutine manager used during teardown"),
        }
    }

    // ---- startup ----

    /// Bind the calling thread as the main worker and return the main
    /// coroutine, then start the remaining workers and the monitor.
    ///
    /// Calling this twice is fatal.
    pub fn create_main_coroutine(&self) -> Arc<Coroutine> {
        if self.started.swap(true, Ordering::AcqRel) {
            fatal("main coroutine already created");
        }
        if coroutine::current().is_some() {
            fatal("calling thread already runs a coroutine");
        }

        let worker = match self.register_worker(WorkerKind::Main) {
            Ok(worker) => worker,
            Err(err) => fatal(&err.to_string()),
        };
        let _ = self.main_worker.set(worker.clone());

        let main = self.create_native_coroutine(&worker, "main".to_string(), CoroutineType::Mutator);
        coroutine::set_current(Some(main.clone()));
        let _ = self.main_coroutine.set(main.clone());

        let extra = self.config.effective_worker_count().saturating_sub(1);
        let created = self.create_workers(extra);
        if created < extra {
            tracing::warn!(requested = extra, created, "started fewer workers than configured");
        }

        if self.config.migration_enabled && self.config.blocked_worker_threshold_ms > 0 {
            match BlockedWorkerMonitor::start(self.self_ref.clone(), self.config.monitor_interval()) {
                Ok(monitor) => *self.monitor.lock() = Some(monitor),
                Err(err) => tracing::warn!(error = %err, "blocked-worker monitor not started"),
            }
        }

        tracing::info!(
            workers = self.worker_count(),
            context = ?self.config.context_kind,
            "coroutine scheduler started"
        );
        main
    }

    /// Native coroutine bound to `worker`'s OS thread
    fn create_native_coroutine(&self, worker: &Arc<Worker>, name: String, coro_type: CoroutineType) -> Arc<Coroutine> {
        let id = self.allocate_coroutine_id();
        let coro = Arc::new(self.factory.create(CoroutineRequest {
            id,
            name,
            context: CoroutineContext::Native,
            entrypoint_kind: EntrypointKind::None,
            completion_event: None,
            coro_type,
            priority: CoroutinePriority::Medium,
            affinity: AffinityMask::single(worker.id()),
        }));
        self.coroutines.insert(coro.clone());

        coro.set_status(CoroutineStatus::Runnable);
        coro.set_status(CoroutineStatus::Running);
        if coro_type == CoroutineType::Mutator {
            worker.claim(&coro);
            worker.on_coro_became_active(&coro);
        } else {
            coro.set_worker(Some(worker.id()));
        }
        coro
    }

    fn remove_native_coroutine(&self, coro: &Arc<Coroutine>) {
        coro.set_status(CoroutineStatus::Terminating);
        if coro.coro_type() == CoroutineType::Mutator {
            if let Some(worker) = coro.worker().and_then(|id| self.worker(id)) {
                worker.release();
            }
        }
        coro.set_worker(None);
        if self.coroutines.remove(coro.id()).is_some() {
            self.free_coroutine_id(coro.id());
        }
    }

    // ---- worker registry ----

    fn register_worker(&self, kind: WorkerKind) -> Result<Arc<Worker>, CoroError> {
        let Some(index) = self.free_worker_ids.lock().pop() else {
            return Err(CoroError::WorkerLimit(self.config.max_workers));
        };
        let worker = Arc::new(Worker::new(WorkerId::from_usize(index), kind, &self.config, self.epoch));
        self.workers.write()[index] = Some(worker.clone());
        tracing::debug!(worker = %worker.id(), ?kind, "worker registered");
        Ok(worker)
    }

    fn unregister_worker(&self, worker: &Worker) {
        let index = worker.id().as_usize();
        let removed = self.workers.write().get_mut(index).and_then(Option::take);
        if removed.is_some() {
            self.free_worker_ids.lock().push(index);
            tracing::debug!(worker = %worker.id(), "worker unregistered");
        }
    }

    fn spawn_worker_thread(&self, worker: Arc<Worker>) -> Result<(), CoroError> {
        let manager = self.strong_self();
        let name = worker.name().to_string();
        let id = worker.id();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || manager.run_worker(&worker))
            .map_err(|source| CoroError::ThreadSpawn { name, source })?;

        let mut threads = self.worker_threads.lock();
        threads.retain(|_, handle| !handle.is_finished());
        threads.insert(id, handle);
        Ok(())
    }

    /// Body of a worker-owned OS thread
    fn run_worker(&self, worker: &Arc<Worker>) {
        let schedule = self.create_native_coroutine(
            worker,
            format!("{}-loop", worker.name()),
            CoroutineType::Schedule,
        );
        coroutine::set_current(Some(schedule.clone()));
        tracing::debug!(worker = %worker.id(), "worker loop started");

        worker.schedule_loop(self, None, None);

        self.retire_worker(worker);
        coroutine::set_current(None);
        self.remove_native_coroutine(&schedule);
        tracing::debug!(worker = %worker.id(), "worker loop stopped");
    }

    /// Hand everything a stopped worker still holds to the others and free
    /// its slot
    fn retire_worker(&self, worker: &Arc<Worker>) {
        let leftovers = worker.close_queue();
        worker.run_posted_callbacks();
        for (entry, _) in leftovers {
            if let Some(coro) = self.coroutine(entry.id) {
                self.requeue_elsewhere(&coro, worker);
            }
        }

        {
            let _transfer = self.waiter_transfer.write();
            let waiters = worker.take_all_waiters();
            if !waiters.is_empty() {
                match self.fallback_worker(worker.id()) {
                    Some(heir) => {
                        for id in waiters.values() {
                            if let Some(coro) = self.coroutine(*id) {
                                worker.release();
                                heir.claim(&coro);
                            }
                        }
                        tracing::debug!(
                            from = %worker.id(),
                            to = %heir.id(),
                            count = waiters.len(),
                            "handed over blocked coroutines"
                        );
                        heir.adopt_waiters(waiters);
                    }
                    None => tracing::warn!(
                        worker = %worker.id(),
                        count = waiters.len(),
                        "no worker left to inherit blocked coroutines"
                    ),
                }
            }
        }

        self.unregister_worker(worker);
        if worker.is_exclusive() {
            self.exclusive_workers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Start up to `count` common workers. Returns how many started.
    pub fn create_workers(&self, count: usize) -> usize {
        let mut created = 0;
        for _ in 0..count {
            let worker = match self.register_worker(WorkerKind::Common) {
                Ok(worker) => worker,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot create worker");
                    break;
                }
            };
            if let Err(err) = self.spawn_worker_thread(worker.clone()) {
                self.unregister_worker(&worker);
                tracing::warn!(error = %err, "cannot create worker");
                break;
            }
            created += 1;
        }
        created
    }

    /// Stop up to `count` common workers, newest first, and wait for their
    /// threads. The caller's own worker is never picked. Returns how many
    /// stopped.
    pub fn finalize_workers(&self, count: usize) -> usize {
        let current = self.current_worker_id();
        let mut victims: Vec<Arc<Worker>> = self
            .workers()
            .into_iter()
            .filter(|w| w.kind() == WorkerKind::Common && w.is_active() && Some(w.id()) != current)
            .collect();
        victims.sort_by_key(|w| Reverse(w.id()));
        victims.truncate(count);

        for worker in &victims {
            worker.deactivate();
        }
        for worker in &victims {
            self.join_worker_thread(worker.id());
        }
        victims.len()
    }

    fn join_worker_thread(&self, id: WorkerId) {
        let handle = self.worker_threads.lock().remove(&id);
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!(worker = %id, "worker thread panicked");
            }
        }
    }

    fn reserve_exclusive(&self) -> Result<(), CoroError> {
        let limit = self.config.exclusive_workers_limit;
        self.exclusive_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| CoroError::ExclusiveWorkerLimit(limit))
    }

    fn spawn_dedicated_worker(&self) -> Result<Arc<Worker>, CoroError> {
        self.reserve_exclusive()?;
        let worker = match self.register_worker(WorkerKind::Exclusive { dedicated: true }) {
            Ok(worker) => worker,
            Err(err) => {
                self.exclusive_workers.fetch_sub(1, Ordering::AcqRel);
                return Err(err);
            }
        };
        if let Err(err) = self.spawn_worker_thread(worker.clone()) {
            self.unregister_worker(&worker);
            self.exclusive_workers.fetch_sub(1, Ordering::AcqRel);
            return Err(err);
        }
        Ok(worker)
    }

    /// Turn the calling OS thread into an exclusive worker and return the
    /// native coroutine now representing it. `None` if the thread already
    /// runs a coroutine or the exclusive-worker limit is reached.
    pub fn create_exclusive_worker_for_thread(&self, name: &str) -> Option<Arc<Coroutine>> {
        if coroutine::current().is_some() {
            tracing::warn!(name, "thread already runs a coroutine");
            return None;
        }
        if let Err(err) = self.reserve_exclusive() {
            tracing::warn!(error = %err, name, "cannot create exclusive worker");
            return None;
        }
        let worker = match self.register_worker(WorkerKind::Exclusive { dedicated: false }) {
            Ok(worker) => worker,
            Err(err) => {
                self.exclusive_workers.fetch_sub(1, Ordering::AcqRel);
                tracing::warn!(error = %err, name, "cannot create exclusive worker");
                return None;
            }
        };

        let coro = self.create_native_coroutine(&worker, name.to_string(), CoroutineType::Mutator);
        coroutine::set_current(Some(coro.clone()));
        tracing::debug!(worker = %worker.id(), name, "exclusive worker bound to thread");
        Some(coro)
    }

    /// Undo [`create_exclusive_worker_for_thread`](Self::create_exclusive_worker_for_thread)
    /// on the calling thread. False if the thread has no exclusive worker or
    /// coroutines pinned to it are still alive.
    pub fn destroy_exclusive_worker(&self) -> bool {
        let Some(coro) = coroutine::current() else {
            return false;
        };
        let Some(worker) = coro.worker().and_then(|id| self.worker(id)) else {
            return false;
        };
        if worker.kind() != (WorkerKind::Exclusive { dedicated: false }) || !coro.is_native() {
            tracing::warn!(worker = %worker.id(), "calling thread is not an exclusive worker");
            return false;
        }
        if worker.assigned() > 1 || worker.ready_len() > 0 || worker.waiter_count() > 0 {
            tracing::warn!(worker = %worker.id(), "exclusive worker still has coroutines");
            return false;
        }

        coroutine::set_current(None);
        self.remove_native_coroutine(&coro);
        worker.deactivate();
        self.retire_worker(&worker);
        true
    }

    // ---- launching ----

    /// Launch a coroutine. `None` when the coroutine limit, the exclusive
    /// worker limit or stack allocation refuses it.
    pub fn launch(
        &self,
        entrypoint: Entrypoint,
        priority: CoroutinePriority,
        mode: LaunchMode,
        abort_on_uncaught: bool,
    ) -> Option<CoroutineId> {
        match self.launch_impl(entrypoint, priority, mode, abort_on_uncaught, None) {
            Ok(coro) => Some(coro.id()),
            Err(err) => {
                self.stats.record_failed_launch();
                tracing::warn!(error = %err, "launch refused");
                None
            }
        }
    }

    /// Launch a coroutine on the caller's worker and switch to it right
    /// away; the caller goes back to the ready queue.
    ///
    /// Degrades to a default launch when called off-scheduler or from a
    /// worker that cannot take unpinned coroutines.
    pub fn launch_immediately(
        &self,
        entrypoint: Entrypoint,
        priority: CoroutinePriority,
        abort_on_uncaught: bool,
    ) -> Option<CoroutineId> {
        let worker = coroutine::current()
            .filter(|caller| caller.coro_type() == CoroutineType::Mutator)
            .and_then(|caller| caller.worker())
            .and_then(|id| self.worker(id))
            .filter(|worker| worker.accepts(AffinityMask::FULL));
        let Some(worker) = worker else {
            tracing::debug!("immediate launch not possible here; launching normally");
            return self.launch(entrypoint, priority, LaunchMode::Default, abort_on_uncaught);
        };

        match self.launch_impl(entrypoint, priority, LaunchMode::Default, abort_on_uncaught, Some(&worker)) {
            Ok(coro) => {
                let id = coro.id();
                drop(coro);
                self.suspend_current(SwitchRequest::LaunchImmediately(id));
                Some(id)
            }
            Err(err) => {
                self.stats.record_failed_launch();
                tracing::warn!(error = %err, "launch refused");
                None
            }
        }
    }

    fn reserve_slot(&self) -> Result<(), CoroError> {
        let limit = self.config.coroutine_count_limit;
        self.live_coroutines
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| CoroError::CoroutineLimit(limit))
    }

    fn release_slot(&self) -> usize {
        self.live_coroutines
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1)
    }

    fn resolve_target(&self, mode: LaunchMode) -> Result<(Arc<Worker>, AffinityMask), CoroError> {
        let pinned = |worker: Arc<Worker>| {
            let affinity = AffinityMask::single(worker.id());
            (worker, affinity)
        };
        match mode {
            LaunchMode::Default => self
                .choose_worker(AffinityMask::FULL, None)
                .map(|worker| (worker, AffinityMask::FULL))
                .ok_or(CoroError::NoEligibleWorker(AffinityMask::FULL.bits())),
            LaunchMode::SameWorker => self
                .current_worker()
                .or_else(|| self.main_worker())
                .map(pinned)
                .ok_or(CoroError::NoEligibleWorker(0)),
            LaunchMode::MainWorker => self
                .main_worker()
                .map(pinned)
                .ok_or(CoroError::NoEligibleWorker(0)),
            LaunchMode::Exclusive => self.spawn_dedicated_worker().map(pinned),
        }
    }

    fn launch_impl(
        &self,
        entrypoint: Entrypoint,
        priority: CoroutinePriority,
        mode: LaunchMode,
        abort_on_uncaught: bool,
        immediate_on: Option<&Arc<Worker>>,
    ) -> Result<Arc<Coroutine>, CoroError> {
        if matches!(entrypoint, Entrypoint::None) {
            fatal("launched coroutines need an entrypoint");
        }
        self.reserve_slot()?;

        let target = match immediate_on {
            Some(worker) => Ok((worker.clone(), AffinityMask::FULL)),
            None => self.resolve_target(mode),
        };
        let (worker, affinity) = match target {
            Ok(target) => target,
            Err(err) => {
                self.release_slot();
                return Err(err);
            }
        };

        let id = self.allocate_coroutine_id();
        let name = format!("coro-{}", id.as_u32());
        let entrypoint_kind = entrypoint.kind();
        let (completion_event, body) = self.build_body(entrypoint, abort_on_uncaught);
        let context = match self.create_context(&name, body) {
            Ok(context) => context,
            Err(err) => {
                self.free_coroutine_id(id);
                self.release_slot();
                if mode == LaunchMode::Exclusive && immediate_on.is_none() {
                    worker.deactivate();
                }
                return Err(err);
            }
        };

        let coro = Arc::new(self.factory.create(CoroutineRequest {
            id,
            name,
            context,
            entrypoint_kind,
            completion_event,
            coro_type: CoroutineType::Mutator,
            priority,
            affinity,
        }));
        self.coroutines.insert(coro.clone());
        self.stats.record_launch();

        coro.set_status(CoroutineStatus::Runnable);
        if immediate_on.is_some() {
            worker.claim(&coro);
        } else if !self.place(&coro, &worker) {
            self.requeue_elsewhere(&coro, &worker);
        }
        tracing::trace!(coroutine = %id, worker = %worker.id(), ?priority, ?mode, "launched");
        Ok(coro)
    }

    fn build_body(&self, entrypoint: Entrypoint, abort_on_uncaught: bool) -> (Option<CoroutineEvent>, CoroutineBody) {
        match entrypoint {
            Entrypoint::Managed(managed) => {
                let stats = self.stats.clone();
                let method = managed.method;
                let body: CoroutineBody = Box::new(move || run_managed(method, abort_on_uncaught, &stats));
                (managed.completion_event, body)
            }
            Entrypoint::Native(native) => (None, Box::new(move || (native.function)(native.param))),
            Entrypoint::None => fatal("launched coroutines need an entrypoint"),
        }
    }

    fn create_context(&self, name: &str, body: CoroutineBody) -> Result<CoroutineContext, CoroError> {
        match self.config.context_kind {
            ContextKind::Fiber => {
                let stack = self.stack_pool.acquire()?;
                Ok(CoroutineContext::Fiber(FiberContext::new(stack, body)))
            }
            ContextKind::Thread => {
                let thread = ThreadContext::new(format!("raya-{}", name), self.config.stack_size, body)?;
                Ok(CoroutineContext::Thread(thread))
            }
        }
    }

    // ---- placement ----

    /// Least-loaded active worker accepting `affinity`
    fn choose_worker(&self, affinity: AffinityMask, exclude: Option<WorkerId>) -> Option<Arc<Worker>> {
        self.workers()
            .into_iter()
            .filter(|w| w.is_active() && Some(w.id()) != exclude && w.accepts(affinity))
            .min_by(|a, b| a.cmp_load(b))
    }

    /// Main worker if it can take over from `retiring`, else any active
    /// non-exclusive worker
    fn fallback_worker(&self, retiring: WorkerId) -> Option<Arc<Worker>> {
        self.main_worker()
            .filter(|main| main.is_active() && main.id() != retiring)
            .or_else(|| {
                self.workers()
                    .into_iter()
                    .find(|w| w.is_active() && w.id() != retiring && !w.is_exclusive())
            })
    }

    /// Queue `coro` on `worker`, moving ownership over. False if the worker
    /// already retired.
    fn place(&self, coro: &Coroutine, worker: &Worker) -> bool {
        let previous = coro.worker();
        let moving = previous != Some(worker.id());
        if moving {
            worker.adopt();
        }
        if !worker.push_runnable(coro) {
            if moving {
                worker.release();
            }
            return false;
        }
        if moving {
            if let Some(previous) = previous.and_then(|id| self.worker(id)) {
                previous.release();
            }
        }
        true
    }

    /// Put a runnable coroutine back on `preferred`, or elsewhere if it retired
    pub(crate) fn requeue(&self, coro: &Coroutine, preferred: &Worker) {
        if !preferred.push_runnable(coro) {
            self.requeue_elsewhere(coro, preferred);
        }
    }

    fn requeue_elsewhere(&self, coro: &Coroutine, from: &Worker) {
        let mut excluded = from.id();
        for _ in 0..self.config.max_workers {
            let target = self
                .choose_worker(coro.affinity(), Some(excluded))
                .or_else(|| {
                    tracing::debug!(coroutine = %coro.id(), "no worker matches affinity; using fallback");
                    self.fallback_worker(excluded)
                });
            let Some(target) = target else {
                break;
            };
            if self.place(coro, &target) {
                return;
            }
            excluded = target.id();
        }
        tracing::warn!(coroutine = %coro.id(), "no worker can run coroutine; it is stranded");
    }

    // ---- switching ----

    /// Yield the current coroutine
    pub fn schedule(&self) {
        self.suspend_current(SwitchRequest::Yield);
    }

    /// Block the current coroutine on the locked event until it happens.
    /// Returns immediately if it already happened. The event lock is
    /// released by the scheduler after the caller is registered as waiter.
    pub fn await_event(&self, guard: EventGuard) {
        if guard.is_happened() {
            return;
        }
        self.suspend_current(SwitchRequest::Block(guard));
    }

    fn suspend_current(&self, request: SwitchRequest) {
        let Some(coro) = coroutine::current() else {
            fatal("coroutine switch requested on a thread without a coroutine");
        };
        if coro.coro_type() == CoroutineType::Schedule {
            fatal("scheduler loop cannot suspend");
        }
        let Some(worker) = coro.worker().and_then(|id| self.worker(id)) else {
            fatal(&format!("{} has no worker", coro.id()));
        };
        if worker.running() != Some(coro.id()) {
            fatal(&format!("{} is not running on {}", coro.id(), worker.id()));
        }
        if worker.is_switch_disabled() {
            fatal(&format!("{} tried to switch while switching is disabled", coro.id()));
        }

        if coro.is_native() {
            // The loop runs right here, on the native coroutine's own stack
            worker.on_coro_became_non_active(&coro);
            let hint = worker.process_request(self, &coro, request);
            worker.schedule_loop(self, Some(&coro), hint);
        } else {
            let suspended_on = worker.id();
            drop(worker);
            coro.set_request(request);
            coro.suspender().suspend();
            self.after_resume(&coro, suspended_on);
        }
    }

    /// Runs first thing after a suspended coroutine is resumed. The
    /// coroutine may have been migrated while it was off-CPU.
    #[inline(never)]
    fn after_resume(&self, coro: &Coroutine, suspended_on: WorkerId) {
        if let Some(resumed_on) = coro.worker() {
            if resumed_on != suspended_on {
                tracing::trace!(
                    coroutine = %coro.id(),
                    from = %suspended_on,
                    to = %resumed_on,
                    "resumed on another worker"
                );
            }
        }
    }

    /// Mark `event` happened and make its waiter runnable again
    pub fn unblock_waiters(&self, event: CoroutineEvent) {
        event.lock().set_happened();
        let event_id = event.id();
        drop(event);

        let _transfer = self.waiter_transfer.read();
        for worker in self.workers() {
            let Some(id) = worker.take_waiter(event_id) else {
                continue;
            };
            let Some(coro) = self.coroutine(id) else {
                fatal(&format!("waiter {} on {} is not a live coroutine", id, event_id));
            };
            coro.set_status(CoroutineStatus::Runnable);

            let target = if self.config.migrate_awakened {
                self.choose_worker(coro.affinity(), None)
                    .unwrap_or_else(|| worker.clone())
            } else {
                worker.clone()
            };
            if !self.place(&coro, &target) {
                self.requeue_elsewhere(&coro, &target);
            }
            tracing::trace!(coroutine = %id, event = %event_id, worker = %target.id(), "woken");
            return;
        }
        tracing::trace!(event = %event_id, "no waiter to wake");
    }

    /// Main coroutine only: wait until every launched coroutine is gone
    pub fn main_coroutine_completion(&self) {
        let Some(main) = coroutine::current().filter(|coro| self.is_main_coroutine(coro)) else {
            fatal("main_coroutine_completion must be called by the main coroutine");
        };

        main.set_status(CoroutineStatus::AwaitLoop);
        loop {
            let mut guard = self.program_completion.lock();
            if self.live_coroutines.load(Ordering::Acquire) == 0 {
                break;
            }
            guard.set_not_happened();
            self.suspend_current(SwitchRequest::Block(guard));
            main.set_status(CoroutineStatus::AwaitLoop);
        }
        main.set_status(CoroutineStatus::Running);
        tracing::debug!("all coroutines finished");
    }

    /// Tear a terminated coroutine down. Runs on the worker that saw it
    /// finish.
    pub(crate) fn destroy_coroutine(&self, id: CoroutineId) {
        let Some(coro) = self.coroutines.remove(id) else {
            fatal(&format!("destroying unknown {}", id));
        };
        let context = std::mem::replace(&mut *coro.context().lock(), CoroutineContext::Native);
        context.recycle(&self.stack_pool);

        let worker = coro.worker().and_then(|w| self.worker(w));
        if let Some(worker) = &worker {
            worker.release();
        }
        coro.set_worker(None);
        self.free_coroutine_id(id);
        let remaining = self.release_slot();
        self.stats.record_completion();
        tracing::trace!(coroutine = %id, remaining, "destroyed");

        if let Some(event) = coro.take_completion_event() {
            event.happen();
        }
        if remaining == 0 {
            self.program_completion.happen();
        }
        if let Some(worker) = worker {
            if worker.is_dedicated() && worker.assigned() == 0 {
                worker.deactivate();
            }
        }
    }

    /// Stop the monitor and every worker, then destroy the main coroutine.
    /// Coroutines still blocked are abandoned.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        let main = self.main_coroutine.get().cloned();
        if let (Some(main), Some(current)) = (&main, coroutine::current()) {
            if !Arc::ptr_eq(main, &current) {
                tracing::warn!(caller = %current.id(), "finalize called outside the main coroutine");
            }
        }

        for worker in self.workers() {
            if worker.kind() == WorkerKind::Common || worker.is_dedicated() {
                worker.deactivate();
            }
        }
        let threads: Vec<(WorkerId, JoinHandle<()>)> = self.worker_threads.lock().drain().collect();
        for (id, handle) in threads {
            if handle.join().is_err() {
                tracing::warn!(worker = %id, "worker thread panicked");
            }
        }

        let mut abandoned = 0;
        for coro in self.coroutines.drain() {
            if coro.is_native() {
                continue;
            }
            abandoned += 1;
            let context = std::mem::replace(&mut *coro.context().lock(), CoroutineContext::Native);
            context.recycle(&self.stack_pool);
        }
        if abandoned > 0 {
            tracing::warn!(count = abandoned, "abandoned coroutines still blocked at finalize");
        }

        if let Some(main) = main {
            main.set_status(CoroutineStatus::Terminating);
            main.set_worker(None);
            self.free_coroutine_id(main.id());
            if coroutine::current().is_some_and(|current| Arc::ptr_eq(&current, &main)) {
                coroutine::set_current(None);
            }
        }
        if let Some(main_worker) = self.main_worker.get() {
            main_worker.deactivate();
            self.unregister_worker(main_worker);
        }
        tracing::info!(stats = ?self.stats(), "coroutine scheduler finalized");
    }

    // ---- migration ----

    /// Called by an idle common worker: pull work from the busiest peer
    pub(crate) fn request_work(&self, idle: &Worker) {
        let candidates: Vec<(Arc<Worker>, usize)> = self
            .workers()
            .into_iter()
            .filter(|w| w.id() != idle.id() && w.is_active())
            .map(|w| {
                let len = w.ready_len();
                (w, len)
            })
            .filter(|(_, len)| *len > 1)
            .collect();
        let Some(busiest) = candidates.iter().map(|(_, len)| *len).max() else {
            return;
        };
        let sources: Vec<&Arc<Worker>> = candidates
            .iter()
            .filter(|(_, len)| *len == busiest)
            .map(|(w, _)| w)
            .collect();
        let source = sources[rand::thread_rng().gen_range(0..sources.len())];

        let moved = idle.migrate_from(source, &self.coroutines);
        if moved > 0 {
            self.stats.record_migrations(moved);
        }
    }

    /// One monitor pass: off-load every worker that looks stuck
    pub(crate) fn check_blocked_workers(&self) {
        let threshold = self.config.blocked_worker_threshold();
        let workers = self.workers();
        for worker in &workers {
            if worker.is_exclusive() || !worker.is_potentially_blocked(threshold) {
                continue;
            }
            let outcome = worker.migrate_coroutines_outward(&workers, &self.coroutines);
            if outcome.moved > 0 {
                self.stats.record_migrations(outcome.moved);
                tracing::debug!(worker = %worker.id(), count = outcome.moved, "off-loaded blocked worker");
            }
            for coro in outcome.stranded {
                self.requeue_elsewhere(&coro, worker);
            }
        }
    }

    // ---- ids ----

    /// Take an id from the bitset. Exhaustion is fatal.
    pub fn allocate_coroutine_id(&self) -> CoroutineId {
        match self.ids.lock().allocate() {
            Some(id) => id,
            None => fatal("coroutine id space exhausted"),
        }
    }

    pub fn free_coroutine_id(&self, id: CoroutineId) {
        if !self.ids.lock().free(id) {
            fatal(&format!("freeing {} which is not allocated", id));
        }
    }

    // ---- introspection ----

    pub fn coroutine(&self, id: CoroutineId) -> Option<Arc<Coroutine>> {
        self.coroutines.get(id)
    }

    pub fn worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.workers.read().get(id.as_usize()).cloned().flatten()
    }

    /// Every registered worker, by id
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.workers.read().iter().flatten().cloned().collect()
    }

    pub fn main_worker(&self) -> Option<Arc<Worker>> {
        self.main_worker.get().cloned()
    }

    pub fn main_coroutine(&self) -> Option<Arc<Coroutine>> {
        self.main_coroutine.get().cloned()
    }

    fn is_main_coroutine(&self, coro: &Arc<Coroutine>) -> bool {
        self.main_coroutine.get().is_some_and(|main| Arc::ptr_eq(main, coro))
    }

    pub fn current_coroutine(&self) -> Option<Arc<Coroutine>> {
        coroutine::current()
    }

    pub fn current_worker_id(&self) -> Option<WorkerId> {
        coroutine::current().and_then(|coro| coro.worker())
    }

    pub fn current_worker(&self) -> Option<Arc<Worker>> {
        self.current_worker_id().and_then(|id| self.worker(id))
    }

    /// Launched coroutines not yet destroyed
    pub fn coroutine_count(&self) -> usize {
        self.live_coroutines.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().iter().flatten().count()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.snapshot(self.coroutine_count(), self.worker_count())
    }

    pub(crate) fn stats_counters(&self) -> &StatsCounters {
        &self.stats
    }

    /// Forbid switching on the current worker until the guard drops
    pub fn disable_coroutine_switch(&self) -> SwitchDisabledGuard {
        SwitchDisabledGuard::new(self.current_worker())
    }

    pub fn callback_poster(&self, worker: WorkerId) -> Option<Arc<dyn CallbackPoster>> {
        self.worker(worker)
            .map(|worker| Arc::new(WorkerCallbackPoster::new(&worker)) as Arc<dyn CallbackPoster>)
    }

    /// Mark the current worker as inside a possibly-blocking native call
    pub fn on_native_call_enter(&self) {
        if let Some(worker) = self.current_worker() {
            worker.on_native_call_enter();
        }
    }

    pub fn on_native_call_exit(&self) {
        if let Some(worker) = self.current_worker() {
            worker.on_native_call_exit();
        }
    }
}

fn run_managed(method: ManagedMethod, abort_on_uncaught: bool, stats: &StatsCounters) {
    let failure = match panic::catch_unwind(AssertUnwindSafe(method)) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(payload) => UncaughtError::new(panic_message(payload.as_ref())),
    };
    if abort_on_uncaught {
        fatal(&failure.to_string());
    }
    stats.record_uncaught();
    tracing::warn!(error = %failure, "coroutine finished with an uncaught error");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            worker_count: 1,
            coroutine_count_limit: 8,
            coroutine_id_space: 128,
            max_workers: 4,
            blocked_worker_threshold_ms: 0,
            ..SchedulerConfig::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let bad = SchedulerConfig {
            max_workers: 0,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            CoroutineManager::with_default_factory(bad),
            Err(CoroError::Config(_))
        ));
    }

    #[test]
    fn test_ids_round_trip_through_manager() {
        let manager = CoroutineManager::with_default_factory(config()).unwrap();
        let a = manager.allocate_coroutine_id();
        let b = manager.allocate_coroutine_id();
        assert_ne!(a, b);
        manager.free_coroutine_id(a);
        manager.free_coroutine_id(b);
    }

    #[test]
    fn test_no_workers_before_start() {
        let manager = CoroutineManager::with_default_factory(config()).unwrap();
        assert_eq!(manager.worker_count(), 0);
        assert_eq!(manager.coroutine_count(), 0);
        assert!(manager.main_coroutine().is_none());
        assert!(manager.current_worker_id().is_none());
        assert!(!manager.disable_coroutine_switch().is_attached());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(payload.as_ref()), "panic");
    }

    #[test]
    fn test_run_managed_counts_failures() {
        let stats = StatsCounters::default();
        run_managed(Box::new(|| Ok(())), false, &stats);
        run_managed(Box::new(|| Err(UncaughtError::new("bad"))), false, &stats);
        run_managed(Box::new(|| panic!("oops")), false, &stats);
        assert_eq!(stats.snapshot(0, 0).uncaught, 2);
    }

    #[test]
    fn test_single_worker_lifecycle() {
        let manager = CoroutineManager::with_default_factory(config()).unwrap();
        let main = manager.create_main_coroutine();
        assert_eq!(manager.worker_count(), 1);
        assert_eq!(main.status(), CoroutineStatus::Running);
        assert_eq!(manager.current_worker_id(), manager.main_worker().map(|w| w.id()));

        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let id = manager.launch(
            Entrypoint::managed(move || {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            CoroutinePriority::Medium,
            LaunchMode::Default,
            false,
        );
        assert!(id.is_some());
        assert_eq!(manager.coroutine_count(), 1);

        manager.main_coroutine_completion();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(manager.coroutine_count(), 0);

        manager.finalize();
        assert!(manager.current_coroutine().is_none());
        assert_eq!(manager.worker_count(), 0);
    }
}
