//! Integration tests for coroutine scheduling on a single worker
//!
//! With one worker the main thread runs every coroutine, so execution order
//! is deterministic. Each scenario runs once with fiber contexts and once
//! with thread contexts.

use parking_lot::Mutex;
use raya_coro::{
    ContextKind, CoroutineEvent, CoroutineManager, CoroutinePriority, CoroutineStatus,
    Entrypoint, LaunchMode, ManagedEntrypoint, SchedulerConfig, UncaughtError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn single_worker(context_kind: ContextKind) -> SchedulerConfig {
    SchedulerConfig {
        worker_count: 1,
        max_workers: 4,
        coroutine_count_limit: 64,
        coroutine_id_space: 1024,
        context_kind,
        stack_size: 128 * 1024,
        blocked_worker_threshold_ms: 0,
        ..SchedulerConfig::default()
    }
}

fn start(config: SchedulerConfig) -> Arc<CoroutineManager> {
    let manager = CoroutineManager::with_default_factory(config).unwrap();
    manager.create_main_coroutine();
    manager
}

fn record(log: &Arc<Mutex<Vec<String>>>, entry: &str) -> Entrypoint {
    let log = log.clone();
    let entry = entry.to_string();
    Entrypoint::managed(move || {
        log.lock().push(entry);
        Ok(())
    })
}

// ===== Priority order =====

fn run_priority_order(kind: ContextKind) {
    let manager = start(single_worker(kind));
    let log = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [
        ("low", CoroutinePriority::Low),
        ("high", CoroutinePriority::High),
        ("medium", CoroutinePriority::Medium),
    ] {
        manager
            .launch(record(&log, name), priority, LaunchMode::Default, false)
            .unwrap();
    }

    manager.main_coroutine_completion();
    assert_eq!(*log.lock(), vec!["high", "medium", "low"]);
    manager.finalize();
}

#[test]
fn test_priority_order_fiber() {
    run_priority_order(ContextKind::Fiber);
}

#[test]
fn test_priority_order_thread() {
    run_priority_order(ContextKind::Thread);
}

#[test]
fn test_same_priority_is_fifo() {
    let manager = start(single_worker(ContextKind::Fiber));
    let log = Arc::new(Mutex::new(Vec::new()));
    for name in ["a", "b", "c", "d"] {
        manager
            .launch(record(&log, name), CoroutinePriority::Medium, LaunchMode::Default, false)
            .unwrap();
    }
    manager.main_coroutine_completion();
    assert_eq!(*log.lock(), vec!["a", "b", "c", "d"]);
    manager.finalize();
}

// ===== Blocking and waking =====

fn run_block_and_wake(kind: ContextKind) {
    let manager = start(single_worker(kind));
    let event = CoroutineEvent::new(&manager);
    let steps = Arc::new(AtomicUsize::new(0));
    let log: Arc<Mutex<Vec<(usize, String, CoroutineStatus)>>> = Arc::new(Mutex::new(Vec::new()));

    let waiter = {
        let manager = manager.clone();
        let event = event.clone();
        let steps = steps.clone();
        let log = log.clone();
        Entrypoint::managed(move || {
            let guard = event.lock();
            manager.await_event(guard);
            let me = manager.current_coroutine().unwrap();
            log.lock().push((steps.fetch_add(1, Ordering::SeqCst), "a resumed".into(), me.status()));
            Ok(())
        })
    };
    let a = manager
        .launch(waiter, CoroutinePriority::Medium, LaunchMode::Default, false)
        .unwrap();

    let waker = {
        let manager = manager.clone();
        let event = event.clone();
        let steps = steps.clone();
        let log = log.clone();
        Entrypoint::managed(move || {
            let a = manager.coroutine(a).unwrap();
            log.lock().push((steps.fetch_add(1, Ordering::SeqCst), "before happen".into(), a.status()));
            assert!(event.happen());
            log.lock().push((steps.fetch_add(1, Ordering::SeqCst), "after happen".into(), a.status()));
            Ok(())
        })
    };
    manager
        .launch(waker, CoroutinePriority::Medium, LaunchMode::Default, false)
        .unwrap();

    manager.main_coroutine_completion();

    let log = log.lock();
    assert_eq!(
        *log,
        vec![
            (0, "before happen".to_string(), CoroutineStatus::Blocked),
            (1, "after happen".to_string(), CoroutineStatus::Runnable),
            (2, "a resumed".to_string(), CoroutineStatus::Running),
        ]
    );
    assert!(event.is_happened());
    manager.finalize();
}

#[test]
fn test_block_and_wake_fiber() {
    run_block_and_wake(ContextKind::Fiber);
}

#[test]
fn test_block_and_wake_thread() {
    run_block_and_wake(ContextKind::Thread);
}

#[test]
fn test_second_happen_does_not_wake_again() {
    let manager = start(single_worker(ContextKind::Fiber));
    let event = CoroutineEvent::new(&manager);
    let wakes = Arc::new(AtomicUsize::new(0));

    let waiter = {
        let manager = manager.clone();
        let event = event.clone();
        let wakes = wakes.clone();
        Entrypoint::managed(move || {
            manager.await_event(event.lock());
            wakes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    manager
        .launch(waiter, CoroutinePriority::Medium, LaunchMode::Default, false)
        .unwrap();

    // (first happen, second happen, switches before, switches after, ready before, ready after)
    let seen = Arc::new(Mutex::new(None));
    let waker = {
        let manager = manager.clone();
        let event = event.clone();
        let seen = seen.clone();
        Entrypoint::managed(move || {
            let worker = manager.current_worker().unwrap();
            let first = event.happen();
            let switches = manager.stats().context_switches;
            let ready = worker.ready_len();
            let second = event.happen();
            *seen.lock() = Some((
                first,
                second,
                switches,
                manager.stats().context_switches,
                ready,
                worker.ready_len(),
            ));
            Ok(())
        })
    };
    manager
        .launch(waker, CoroutinePriority::Medium, LaunchMode::Default, false)
        .unwrap();

    manager.main_coroutine_completion();
    let (first, second, switches_before, switches_after, ready_before, ready_after) =
        seen.lock().take().unwrap();
    assert!(first);
    assert!(!second);
    assert_eq!(switches_after, switches_before);
    assert_eq!(ready_after, ready_before);
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().uncaught, 0);
    manager.finalize();
}

#[test]
fn test_await_happened_event_returns_immediately() {
    let manager = start(single_worker(ContextKind::Fiber));
    let event = CoroutineEvent::new(&manager);
    event.happen();

    let before = manager.stats().context_switches;
    manager.await_event(event.lock());
    assert_eq!(manager.stats().context_switches, before);
    manager.finalize();
}

#[test]
fn test_yield_interleaves_coroutines() {
    let manager = start(single_worker(ContextKind::Fiber));
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["x", "y"] {
        let manager_ref = manager.clone();
        let log = log.clone();
        manager
            .launch(
                Entrypoint::managed(move || {
                    for i in 0..3 {
                        log.lock().push(format!("{}{}", name, i));
                        manager_ref.schedule();
                    }
                    Ok(())
                }),
                CoroutinePriority::Medium,
                LaunchMode::Default,
                false,
            )
            .unwrap();
    }

    manager.main_coroutine_completion();
    assert_eq!(*log.lock(), vec!["x0", "y0", "x1", "y1", "x2", "y2"]);
    manager.finalize();
}

#[test]
fn test_completion_event_fires_after_destroy() {
    let manager = start(single_worker(ContextKind::Fiber));
    let done = CoroutineEvent::new(&manager);
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();

    let entry = ManagedEntrypoint::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .with_completion_event(done.clone());
    manager
        .launch(Entrypoint::Managed(entry), CoroutinePriority::Medium, LaunchMode::Default, false)
        .unwrap();

    // The main coroutine blocks on the completion event itself
    manager.await_event(done.lock());
    assert!(done.is_happened());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(manager.coroutine_count(), 0);
    manager.finalize();
}

// ===== Launch variants =====

#[test]
fn test_launch_immediately_runs_before_caller_continues() {
    let manager = start(single_worker(ContextKind::Fiber));
    let log = Arc::new(Mutex::new(Vec::new()));

    manager
        .launch(record(&log, "queued"), CoroutinePriority::Medium, LaunchMode::Default, false)
        .unwrap();
    manager
        .launch_immediately(record(&log, "immediate"), CoroutinePriority::Low, false)
        .unwrap();
    log.lock().push("main".to_string());

    manager.main_coroutine_completion();
    // The caller went back to the queue behind the coroutine already there
    assert_eq!(*log.lock(), vec!["immediate", "queued", "main"]);
    manager.finalize();
}

#[test]
fn test_coroutine_limit_refuses_launch() {
    let mut config = single_worker(ContextKind::Fiber);
    config.coroutine_count_limit = 2;
    let manager = start(config);
    let log = Arc::new(Mutex::new(Vec::new()));

    assert!(manager
        .launch(record(&log, "one"), CoroutinePriority::Medium, LaunchMode::Default, false)
        .is_some());
    assert!(manager
        .launch(record(&log, "two"), CoroutinePriority::Medium, LaunchMode::Default, false)
        .is_some());
    assert_eq!(manager.coroutine_count(), 2);

    assert!(manager
        .launch(record(&log, "three"), CoroutinePriority::Medium, LaunchMode::Default, false)
        .is_none());
    assert_eq!(manager.coroutine_count(), 2);
    assert_eq!(manager.stats().failed_launches, 1);

    manager.main_coroutine_completion();
    assert_eq!(*log.lock(), vec!["one", "two"]);

    // Slots are free again
    assert!(manager
        .launch(record(&log, "four"), CoroutinePriority::Medium, LaunchMode::Default, false)
        .is_some());
    manager.main_coroutine_completion();
    manager.finalize();
}

static NATIVE_PARAM: AtomicUsize = AtomicUsize::new(0);

fn native_entry(param: usize) {
    NATIVE_PARAM.store(param, Ordering::SeqCst);
}

#[test]
fn test_native_entrypoint_receives_param() {
    let manager = start(single_worker(ContextKind::Fiber));
    manager
        .launch(
            Entrypoint::native(native_entry, 42),
            CoroutinePriority::Medium,
            LaunchMode::MainWorker,
            false,
        )
        .unwrap();
    manager.main_coroutine_completion();
    assert_eq!(NATIVE_PARAM.load(Ordering::SeqCst), 42);
    manager.finalize();
}

#[test]
fn test_uncaught_errors_are_counted() {
    let manager = start(single_worker(ContextKind::Fiber));
    manager
        .launch(
            Entrypoint::managed(|| Err(UncaughtError::new("boom"))),
            CoroutinePriority::Medium,
            LaunchMode::Default,
            false,
        )
        .unwrap();
    manager
        .launch(
            Entrypoint::managed(|| panic!("kaboom")),
            CoroutinePriority::Medium,
            LaunchMode::Default,
            false,
        )
        .unwrap();

    manager.main_coroutine_completion();
    let stats = manager.stats();
    assert_eq!(stats.uncaught, 2);
    assert_eq!(stats.completed, 2);
    manager.finalize();
}

#[test]
fn test_ids_are_reused_after_destroy() {
    let mut config = single_worker(ContextKind::Fiber);
    config.coroutine_count_limit = 4;
    config.coroutine_id_space = 16;
    let manager = start(config);
    let log = Arc::new(Mutex::new(Vec::new()));

    // Far more launches than ids: every round returns its ids
    for round in 0..10 {
        for i in 0..4 {
            manager
                .launch(
                    record(&log, &format!("{}-{}", round, i)),
                    CoroutinePriority::Medium,
                    LaunchMode::Default,
                    false,
                )
                .unwrap();
        }
        manager.main_coroutine_completion();
    }
    assert_eq!(log.lock().len(), 40);
    manager.finalize();
}

#[test]
fn test_posted_callback_runs_on_worker_thread() {
    let manager = start(single_worker(ContextKind::Fiber));
    let main_thread = std::thread::current().id();
    let event = CoroutineEvent::new(&manager);

    let waiter = {
        let manager = manager.clone();
        let event = event.clone();
        Entrypoint::managed(move || {
            manager.await_event(event.lock());
            Ok(())
        })
    };
    manager
        .launch(waiter, CoroutinePriority::Medium, LaunchMode::MainWorker, false)
        .unwrap();

    let poster = manager
        .callback_poster(manager.main_worker().unwrap().id())
        .unwrap();
    let ran_on = Arc::new(Mutex::new(None));
    let slot = ran_on.clone();
    let fire = event.clone();
    std::thread::spawn(move || {
        assert!(poster.post(Box::new(move || {
            *slot.lock() = Some(std::thread::current().id());
            fire.happen();
        })));
    })
    .join()
    .unwrap();

    manager.main_coroutine_completion();
    assert_eq!(*ran_on.lock(), Some(main_thread));
    manager.finalize();
}

#[test]
fn test_switch_guard_outside_switches() {
    let manager = start(single_worker(ContextKind::Fiber));
    {
        let guard = manager.disable_coroutine_switch();
        assert!(guard.is_attached());
        assert!(manager.main_worker().unwrap().is_switch_disabled());
    }
    assert!(!manager.main_worker().unwrap().is_switch_disabled());
    manager.finalize();
}
