//! `raya-coro run`: drive the scheduler with a synthetic workload
//!
//! Every coroutine yields a number of times. Coroutines are also chained by
//! events: each one waits for its predecessor's gate before firing its own,
//! so the run exercises blocking and cross-worker wakeups as well.

use anyhow::{bail, Context};
use raya_coro::{
    ContextKind, CoroutineEvent, CoroutineManager, CoroutinePriority, Entrypoint, LaunchMode,
    SchedulerConfig,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub struct RunArgs {
    pub config: Option<PathBuf>,
    pub workers: Option<usize>,
    pub coroutines: usize,
    pub yields: usize,
    pub context: Option<String>,
}

pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }
    if let Some(context) = &args.context {
        config.context_kind = context.parse::<ContextKind>()?;
    }
    if args.coroutines > config.coroutine_count_limit {
        bail!(
            "{} coroutines requested but coroutine_count_limit is {}",
            args.coroutines,
            config.coroutine_count_limit
        );
    }

    let manager = CoroutineManager::with_default_factory(config)?;
    manager.create_main_coroutine();

    let started = Instant::now();
    let finished = Arc::new(AtomicUsize::new(0));
    let gates: Arc<Vec<CoroutineEvent>> =
        Arc::new((0..=args.coroutines).map(|_| CoroutineEvent::new(&manager)).collect());

    let mut launched = 0;
    for index in 0..args.coroutines {
        let manager_ref = manager.clone();
        let gates = gates.clone();
        let finished = finished.clone();
        let yields = args.yields;
        let entry = Entrypoint::managed(move || {
            for _ in 0..yields {
                manager_ref.schedule();
            }
            manager_ref.await_event(gates[index].lock());
            gates[index + 1].happen();
            finished.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let priority = CoroutinePriority::ALL[index % 3];
        if manager.launch(entry, priority, LaunchMode::Default, false).is_some() {
            launched += 1;
        } else {
            // Later coroutines would wait on a gate nobody fires
            tracing::warn!(index, "launch refused; stopping early");
            break;
        }
    }

    if let Some(first) = gates.first() {
        first.happen();
    }
    manager.main_coroutine_completion();
    let elapsed = started.elapsed();

    println!(
        "{} of {} launched coroutines finished in {:.2?}",
        finished.load(Ordering::Relaxed),
        launched,
        elapsed
    );
    println!("{}", manager.stats());
    manager.finalize();
    Ok(())
}
