//! Thread-backed contexts
//!
//! Each coroutine gets its own parked OS thread. Only one side runs at a
//! time: the worker hands the baton over on resume and waits until the
//! coroutine thread hands it back (suspend) or finishes.

use super::{CoroutineBody, ResumeOutcome};
use crate::coroutine::{set_current, Coroutine};
use crate::error::{fatal, CoroError};
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Turn {
    /// Thread spawned, body not entered yet
    NotStarted,
    Worker,
    Coroutine,
    Finished,
    /// Destroyed before it ever ran
    Cancelled,
}

/// Turn-taking handshake between a worker and a coroutine thread
pub(crate) struct Baton {
    turn: Mutex<Turn>,
    cv: Condvar,
    owner: OnceLock<Weak<Coroutine>>,
}

impl Baton {
    fn new() -> Self {
        Self {
            turn: Mutex::new(Turn::NotStarted),
            cv: Condvar::new(),
            owner: OnceLock::new(),
        }
    }

    /// Hand control back to the worker and park until resumed.
    /// Called on the coroutine thread.
    pub(crate) fn suspend(&self) {
        let mut turn = self.turn.lock();
        if *turn != Turn::Coroutine {
            let message = format!("thread coroutine suspended out of turn ({:?})", *turn);
            drop(turn);
            fatal(&message);
        }
        *turn = Turn::Worker;
        self.cv.notify_all();
        while *turn == Turn::Worker {
            self.cv.wait(&mut turn);
        }
    }

    /// Park until the first resume. Returns false if cancelled instead.
    fn wait_first_turn(&self) -> bool {
        let mut turn = self.turn.lock();
        while *turn == Turn::NotStarted {
            self.cv.wait(&mut turn);
        }
        *turn == Turn::Coroutine
    }

    fn finish(&self) {
        *self.turn.lock() = Turn::Finished;
        self.cv.notify_all();
    }
}

/// Marks the baton finished even if the body unwinds
struct FinishOnDrop(Arc<Baton>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        set_current(None);
        self.0.finish();
    }
}

/// Coroutine context backed by a dedicated OS thread
pub struct ThreadContext {
    baton: Arc<Baton>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadContext {
    /// Spawn the (parked) coroutine thread
    pub(crate) fn new(name: String, stack_size: usize, body: CoroutineBody) -> Result<Self, CoroError> {
        let baton = Arc::new(Baton::new());
        let thread_baton = baton.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .stack_size(stack_size)
            .spawn(move || {
                if !thread_baton.wait_first_turn() {
                    return;
                }
                let _finish = FinishOnDrop(thread_baton.clone());
                if let Some(owner) = thread_baton.owner.get().and_then(Weak::upgrade) {
                    set_current(Some(owner));
                }
                body();
            })
            .map_err(|source| CoroError::ThreadSpawn { name, source })?;

        Ok(Self {
            baton,
            handle: Some(handle),
        })
    }

    pub(crate) fn baton(&self) -> Arc<Baton> {
        self.baton.clone()
    }

    /// Record the owning coroutine so the thread can publish it as current
    pub(crate) fn bind_owner(&self, owner: &Arc<Coroutine>) {
        let _ = self.baton.owner.set(Arc::downgrade(owner));
    }

    pub(crate) fn resume(&mut self) -> ResumeOutcome {
        let baton = &self.baton;
        let mut turn = baton.turn.lock();
        match *turn {
            Turn::NotStarted | Turn::Worker => {}
            other => {
                drop(turn);
                fatal(&format!("resuming a thread coroutine in state {:?}", other));
            }
        }
        *turn = Turn::Coroutine;
        baton.cv.notify_all();
        while *turn == Turn::Coroutine {
            baton.cv.wait(&mut turn);
        }
        if *turn == Turn::Finished {
            ResumeOutcome::Finished
        } else {
            ResumeOutcome::Suspended
        }
    }

    /// Join the thread, or detach it if the coroutine was abandoned mid-body
    pub(crate) fn recycle(mut self) {
        let state = {
            let mut turn = self.baton.turn.lock();
            if *turn == Turn::NotStarted {
                *turn = Turn::Cancelled;
                self.baton.cv.notify_all();
            }
            *turn
        };

        let Some(handle) = self.handle.take() else {
            return;
        };
        match state {
            Turn::Worker => {
                tracing::warn!(
                    thread = ?handle.thread().name(),
                    "detaching thread of a coroutine abandoned while suspended"
                );
            }
            _ => {
                if handle.join().is_err() {
                    tracing::warn!("coroutine thread panicked");
                }
            }
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let mut turn = self.baton.turn.lock();
            if *turn == Turn::NotStarted {
                *turn = Turn::Cancelled;
                self.baton.cv.notify_all();
            }
        }
    }
}
