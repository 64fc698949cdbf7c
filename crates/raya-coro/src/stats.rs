//! Scheduler statistics

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Total coroutines launched
    pub launched: u64,

    /// Total coroutines that ran to completion and were destroyed
    pub completed: u64,

    /// Currently live launched coroutines
    pub live: usize,

    /// Currently registered workers (main, common and exclusive)
    pub workers: usize,

    /// Switches from a worker loop into a coroutine
    pub context_switches: u64,

    /// Coroutines moved between ready queues
    pub migrations: u64,

    /// Launches refused for lack of resources
    pub failed_launches: u64,

    /// Managed entrypoints that returned an error or panicked
    pub uncaught: u64,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "launched:         {}", self.launched)?;
        writeln!(f, "completed:        {}", self.completed)?;
        writeln!(f, "live:             {}", self.live)?;
        writeln!(f, "workers:          {}", self.workers)?;
        writeln!(f, "context switches: {}", self.context_switches)?;
        writeln!(f, "migrations:       {}", self.migrations)?;
        writeln!(f, "failed launches:  {}", self.failed_launches)?;
        write!(f, "uncaught errors:  {}", self.uncaught)
    }
}

/// Live counters shared by the manager and its workers
#[derive(Debug, Default)]
pub struct StatsCounters {
    launched: AtomicU64,
    completed: AtomicU64,
    context_switches: AtomicU64,
    migrations: AtomicU64,
    failed_launches: AtomicU64,
    uncaught: AtomicU64,
}

impl StatsCounters {
    pub fn record_launch(&self) {
        self.launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migrations(&self, count: usize) {
        self.migrations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_failed_launch(&self) {
        self.failed_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_uncaught(&self) {
        self.uncaught.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot; `live` and `workers` come from the caller
    pub fn snapshot(&self, live: usize, workers: usize) -> SchedulerStats {
        SchedulerStats {
            launched: self.launched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            live,
            workers,
            context_switches: self.context_switches.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            failed_launches: self.failed_launches.load(Ordering::Relaxed),
            uncaught: self.uncaught.load(Ordering::Relaxed),
        }
    }
}
