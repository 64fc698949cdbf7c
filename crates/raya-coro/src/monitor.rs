//! Blocked-worker monitor (like Go's sysmon)
//!
//! Switching is cooperative, so a coroutine that spins or sits in a
//! blocking native call holds its worker hostage. The monitor thread polls
//! the workers and pushes the ready queue of any worker that has not
//! switched for `blocked_worker_threshold_ms` out to its peers.

use crate::error::CoroError;
use crate::manager::CoroutineManager;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread;
use std::time::Duration;

/// Background thread watching for stuck workers
pub struct BlockedWorkerMonitor {
    /// Monitor thread handle
    handle: Option<thread::JoinHandle<()>>,

    /// Dropping or sending on this stops the thread
    shutdown: Option<Sender<()>>,
}

impl BlockedWorkerMonitor {
    /// Spawn the monitoring thread
    pub(crate) fn start(manager: Weak<CoroutineManager>, interval: Duration) -> Result<Self, CoroError> {
        let (shutdown, signal) = channel::bounded::<()>(1);
        let name = "raya-coro-monitor".to_string();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                loop {
                    match signal.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    manager.check_blocked_workers();
                }
                tracing::debug!("blocked-worker monitor shutting down");
            })
            .map_err(|source| CoroError::ThreadSpawn { name, source })?;

        Ok(Self {
            handle: Some(handle),
            shutdown: Some(shutdown),
        })
    }

    /// Stop the monitoring thread and wait for it
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            // The last manager reference may be released on the monitor
            // thread itself
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("blocked-worker monitor panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for BlockedWorkerMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
