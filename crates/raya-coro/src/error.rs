//! Runtime error types.
//!
//! Resource exhaustion is reported through [`CoroError`] and surfaces as
//! `None`/`false` at the public API. Contract violations never propagate:
//! they go through [`fatal`] and terminate the process.

use std::path::PathBuf;

/// Errors that can occur while configuring or growing the runtime.
#[derive(Debug, thiserror::Error)]
pub enum CoroError {
    /// Invalid configuration value
    #[error("Invalid scheduler config: {0}")]
    Config(String),

    /// Failed to read a configuration file
    #[error("Failed to read config file {path}: {source}")]
    ConfigIo {
        /// File that could not be read
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse scheduler config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("Failed to serialize scheduler config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Fiber stack could not be mapped
    #[error("Failed to allocate coroutine stack: {0}")]
    StackAllocation(#[from] std::io::Error),

    /// Live coroutine count reached `coroutine_count_limit`
    #[error("Coroutine count limit reached ({0})")]
    CoroutineLimit(usize),

    /// No free worker slot
    #[error("Worker limit reached ({0})")]
    WorkerLimit(usize),

    /// No free exclusive worker slot
    #[error("Exclusive worker limit reached ({0})")]
    ExclusiveWorkerLimit(usize),

    /// No worker accepts the requested affinity
    #[error("No eligible worker for affinity {0:#x}")]
    NoEligibleWorker(u64),

    /// OS refused to spawn a thread
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Thread name
        name: String,
        /// Underlying IO error
        source: std::io::Error,
    },
}

/// Failure reported by a managed entrypoint (the analogue of an uncaught
/// exception escaping a coroutine body).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Uncaught error in coroutine: {message}")]
pub struct UncaughtError {
    /// Human-readable description
    pub message: String,
}

impl UncaughtError {
    /// Create an uncaught error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Abort the process after a programming-contract violation.
///
/// Continuing after a broken scheduling invariant risks corrupting a native
/// stack, so this never unwinds.
#[cold]
#[inline(never)]
pub fn fatal(message: &str) -> ! {
    tracing::error!(target: "raya_coro", "fatal: {}", message);
    eprintln!("raya-coro fatal: {}", message);
    std::process::abort()
}
