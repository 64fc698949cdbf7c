//! Scheduler configuration (raya-coro.toml)
//!
//! Every tunable the runtime reads lives here. A config is either built in
//! code (`SchedulerConfig::default()` plus field updates) or loaded from TOML:
//!
//! ```toml
//! worker_count = 4
//! coroutine_count_limit = 10000
//! context_kind = "fiber"
//! blocked_worker_threshold_ms = 100
//!
//! [order]
//! critical = "stack"
//! ```

use crate::error::CoroError;
use crate::priority_queue::{CoroutinePriority, OrderDiscipline};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Hard cap on workers: affinity masks are 64-bit.
pub const MAX_WORKERS_HARD_LIMIT: usize = 64;

/// Smallest fiber stack we accept.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Which native backend executes coroutine bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Stackful fibers switched in user space on the worker thread
    #[default]
    Fiber,
    /// One parked OS thread per coroutine, handed a baton by its worker
    Thread,
}

impl std::str::FromStr for ContextKind {
    type Err = CoroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fiber" => Ok(ContextKind::Fiber),
            "thread" => Ok(ContextKind::Thread),
            other => Err(CoroError::Config(format!(
                "unknown context kind '{}' (expected 'fiber' or 'thread')",
                other
            ))),
        }
    }
}

/// Per-priority order discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTable {
    #[serde(default = "default_queue_order")]
    pub low: OrderDiscipline,
    #[serde(default = "default_queue_order")]
    pub medium: OrderDiscipline,
    #[serde(default = "default_queue_order")]
    pub high: OrderDiscipline,
    #[serde(default = "default_queue_order")]
    pub critical: OrderDiscipline,
}

fn default_queue_order() -> OrderDiscipline {
    OrderDiscipline::Queue
}

impl Default for OrderTable {
    fn default() -> Self {
        Self {
            low: OrderDiscipline::Queue,
            medium: OrderDiscipline::Queue,
            high: OrderDiscipline::Queue,
            critical: OrderDiscipline::Queue,
        }
    }
}

impl OrderTable {
    /// Discipline configured for a priority level
    pub fn get(&self, priority: CoroutinePriority) -> OrderDiscipline {
        match priority {
            CoroutinePriority::Low => self.low,
            CoroutinePriority::Medium => self.medium,
            CoroutinePriority::High => self.high,
            CoroutinePriority::Critical => self.critical,
        }
    }

    /// Flatten into an array indexed by priority level
    pub fn as_array(&self) -> [OrderDiscipline; CoroutinePriority::COUNT] {
        [self.low, self.medium, self.high, self.critical]
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Total workers including the main worker (0 = number of CPUs)
    pub worker_count: usize,

    /// Upper bound on common workers after `create_workers`
    pub max_workers: usize,

    /// Maximum simultaneously existing exclusive workers
    pub exclusive_workers_limit: usize,

    /// Maximum live launched coroutines (native coroutines not counted)
    pub coroutine_count_limit: usize,

    /// Size of the coroutine id space (id 0 is reserved)
    pub coroutine_id_space: usize,

    /// Native backend for coroutine bodies
    pub context_kind: ContextKind,

    /// Stack size in bytes for fibers and coroutine threads
    pub stack_size: usize,

    /// Number of fiber stacks kept for reuse
    pub stack_pool_capacity: usize,

    /// Let idle workers pull work and the monitor push work
    pub migration_enabled: bool,

    /// Place unblocked coroutines on the least-loaded eligible worker
    pub migrate_awakened: bool,

    /// A worker that has not switched for this long while holding ready
    /// coroutines is treated as blocked
    pub blocked_worker_threshold_ms: u64,

    /// Blocked-worker monitor polling period
    pub monitor_interval_ms: u64,

    /// How long an idle worker sleeps before re-checking for migration
    pub idle_wait_ms: u64,

    /// Smoothing factor of the load-factor moving average, in (0, 1]
    pub load_factor_alpha: f64,

    /// Order discipline per priority level
    pub order: OrderTable,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 0,
            max_workers: MAX_WORKERS_HARD_LIMIT,
            exclusive_workers_limit: 4,
            coroutine_count_limit: 10_000,
            coroutine_id_space: 65_536,
            context_kind: ContextKind::Fiber,
            stack_size: 256 * 1024,
            stack_pool_capacity: 64,
            migration_enabled: true,
            migrate_awakened: false,
            blocked_worker_threshold_ms: 100,
            monitor_interval_ms: 10,
            idle_wait_ms: 5,
            load_factor_alpha: 0.25,
            order: OrderTable::default(),
        }
    }
}

impl SchedulerConfig {
    /// Parse a config from a TOML string and validate it
    pub fn from_toml_str(source: &str) -> Result<Self, CoroError> {
        let config: SchedulerConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoroError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| CoroError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String, CoroError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Worker count with the CPU default applied
    pub fn effective_worker_count(&self) -> usize {
        if self.worker_count == 0 {
            num_cpus::get().min(self.max_workers)
        } else {
            self.worker_count
        }
    }

    /// Blocked-worker threshold as a Duration
    pub fn blocked_worker_threshold(&self) -> Duration {
        Duration::from_millis(self.blocked_worker_threshold_ms)
    }

    /// Monitor polling period as a Duration
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Idle wait as a Duration
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<(), CoroError> {
        if self.max_workers == 0 || self.max_workers > MAX_WORKERS_HARD_LIMIT {
            return Err(CoroError::Config(format!(
                "max_workers must be in 1..={}, got {}",
                MAX_WORKERS_HARD_LIMIT, self.max_workers
            )));
        }
        if self.worker_count > self.max_workers {
            return Err(CoroError::Config(format!(
                "worker_count ({}) exceeds max_workers ({})",
                self.worker_count, self.max_workers
            )));
        }
        if self.coroutine_count_limit == 0 {
            return Err(CoroError::Config(
                "coroutine_count_limit must be at least 1".to_string(),
            ));
        }
        // Every live coroutine plus one scheduler pseudo-coroutine per worker
        // needs an id; id 0 is never handed out.
        let ids_needed = self.coroutine_count_limit + self.max_workers + self.exclusive_workers_limit;
        if self.coroutine_id_space <= ids_needed {
            return Err(CoroError::Config(format!(
                "coroutine_id_space ({}) must exceed coroutine_count_limit + max_workers + exclusive_workers_limit ({})",
                self.coroutine_id_space, ids_needed
            )));
        }
        if self.coroutine_id_space > u32::MAX as usize {
            return Err(CoroError::Config(
                "coroutine_id_space must fit in 32 bits".to_string(),
            ));
        }
        if self.stack_size < MIN_STACK_SIZE {
            return Err(CoroError::Config(format!(
                "stack_size must be at least {} bytes, got {}",
                MIN_STACK_SIZE, self.stack_size
            )));
        }
        if !(self.load_factor_alpha > 0.0 && self.load_factor_alpha <= 1.0) {
            return Err(CoroError::Config(format!(
                "load_factor_alpha must be in (0, 1], got {}",
                self.load_factor_alpha
            )));
        }
        if self.monitor_interval_ms == 0 || self.idle_wait_ms == 0 {
            return Err(CoroError::Config(
                "monitor_interval_ms and idle_wait_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.effective_worker_count() >= 1);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = SchedulerConfig::from_toml_str(
            r#"
            worker_count = 3
            context_kind = "thread"
            blocked_worker_threshold_ms = 250

            [order]
            critical = "stack"
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_count, 3);
        assert_eq!(config.context_kind, ContextKind::Thread);
        assert_eq!(config.blocked_worker_threshold(), Duration::from_millis(250));
        assert_eq!(config.order.critical, OrderDiscipline::Stack);
        assert_eq!(config.order.low, OrderDiscipline::Queue);
        // Untouched fields keep their defaults
        assert_eq!(config.stack_size, SchedulerConfig::default().stack_size);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = SchedulerConfig::default();
        config.worker_count = 2;
        config.order.high = OrderDiscipline::Stack;
        let text = config.to_toml_string().unwrap();
        assert_eq!(SchedulerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_reject_small_id_space() {
        let err = SchedulerConfig::from_toml_str(
            "coroutine_count_limit = 100\ncoroutine_id_space = 50\n",
        )
        .unwrap_err();
        assert!(matches!(err, CoroError::Config(_)));
    }

    #[test]
    fn test_reject_too_many_workers() {
        let mut config = SchedulerConfig::default();
        config.max_workers = 65;
        assert!(config.validate().is_err());

        let mut config = SchedulerConfig::default();
        config.max_workers = 2;
        config.worker_count = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reject_bad_alpha() {
        let mut config = SchedulerConfig::default();
        config.load_factor_alpha = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_type_is_parse_error() {
        let err = SchedulerConfig::from_toml_str("worker_count = \"many\"").unwrap_err();
        assert!(matches!(err, CoroError::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raya-coro.toml");
        std::fs::write(&path, "worker_count = 1\nmigration_enabled = false\n").unwrap();

        let config = SchedulerConfig::load(&path).unwrap();
        assert_eq!(config.worker_count, 1);
        assert!(!config.migration_enabled);

        let missing = SchedulerConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, CoroError::ConfigIo { .. }));
    }

    #[test]
    fn test_context_kind_from_str() {
        assert_eq!("fiber".parse::<ContextKind>().unwrap(), ContextKind::Fiber);
        assert_eq!("thread".parse::<ContextKind>().unwrap(), ContextKind::Thread);
        assert!("green".parse::<ContextKind>().is_err());
    }
}
