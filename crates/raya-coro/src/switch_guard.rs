//! Scoped ban on coroutine switches
//!
//! While a [`SwitchDisabledGuard`] is alive, any attempt by a coroutine on
//! that worker to yield, block or launch-immediately aborts the process.
//! Guards nest; switching is allowed again once the last one is dropped.

use crate::worker::Worker;
use std::sync::Arc;

/// RAII guard returned by `CoroutineManager::disable_coroutine_switch`
#[must_use = "switching is re-enabled as soon as the guard is dropped"]
pub struct SwitchDisabledGuard {
    worker: Option<Arc<Worker>>,
}

impl SwitchDisabledGuard {
    pub(crate) fn new(worker: Option<Arc<Worker>>) -> Self {
        if let Some(worker) = &worker {
            worker.disable_switch();
        }
        Self { worker }
    }

    /// Whether the guard is attached to a worker (false off-scheduler)
    pub fn is_attached(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for SwitchDisabledGuard {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.enable_switch();
        }
    }
}
