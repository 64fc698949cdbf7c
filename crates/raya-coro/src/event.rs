//! One-shot events used to block and wake coroutines
//!
//! An event is a `happened` flag behind a mutex. Awaiting follows a strict
//! handoff: the caller locks the event, and if it has not happened yet passes
//! the [`EventGuard`] to [`CoroutineManager::await_event`]. The scheduler
//! drops the guard only after the caller is registered as a waiter, so a
//! concurrent [`CoroutineEvent::happen`] can never slip in between the check
//! and the registration.
//!
//! [`CoroutineManager::await_event`]: crate::manager::CoroutineManager::await_event

use crate::manager::CoroutineManager;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Unique identifier for an event
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

impl EventId {
    fn next() -> Self {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct EventState {
    happened: bool,
}

/// Lockable one-shot "happened" flag
///
/// Cloning yields another handle to the same event.
#[derive(Clone)]
pub struct CoroutineEvent {
    id: EventId,
    state: Arc<Mutex<EventState>>,
    manager: Weak<CoroutineManager>,
}

impl CoroutineEvent {
    /// Create an event whose `happen` wakes waiters through `manager`
    pub fn new(manager: &Arc<CoroutineManager>) -> Self {
        Self::with_manager(Arc::downgrade(manager))
    }

    pub(crate) fn with_manager(manager: Weak<CoroutineManager>) -> Self {
        Self {
            id: EventId::next(),
            state: Arc::new(Mutex::new(EventState::default())),
            manager,
        }
    }

    /// Create an event not attached to any scheduler; `happen` only sets the flag
    pub fn detached() -> Self {
        Self::with_manager(Weak::new())
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Lock the event. Pass the guard to `await_event` to block on it.
    pub fn lock(&self) -> EventGuard {
        EventGuard {
            id: self.id,
            guard: self.state.lock_arc(),
        }
    }

    pub fn is_happened(&self) -> bool {
        self.state.lock().happened
    }

    /// Mark the event happened and wake its waiter.
    ///
    /// Returns false if the event had already happened; the second call does
    /// not wake anything.
    pub fn happen(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.happened {
                tracing::debug!(event = %self.id, "event already happened");
                return false;
            }
            state.happened = true;
        }

        if let Some(manager) = self.manager.upgrade() {
            manager.unblock_waiters(self.clone());
        }
        true
    }

    /// Reset a reusable event so it can be awaited again
    pub fn set_not_happened(&self) {
        self.state.lock().happened = false;
    }
}

impl fmt::Debug for CoroutineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineEvent")
            .field("id", &self.id)
            .field("happened", &self.is_happened())
            .finish()
    }
}

/// Held lock on a [`CoroutineEvent`]
///
/// The guard may be released from a different thread than the one that took
/// it: the worker loop drops it after the waiter registration.
pub struct EventGuard {
    id: EventId,
    guard: ArcMutexGuard<RawMutex, EventState>,
}

impl EventGuard {
    pub fn event_id(&self) -> EventId {
        self.id
    }

    pub fn is_happened(&self) -> bool {
        self.guard.happened
    }

    /// Reset the flag while holding the lock
    pub fn set_not_happened(&mut self) {
        self.guard.happened = false;
    }

    pub(crate) fn set_happened(&mut self) {
        self.guard.happened = true;
    }
}

impl fmt::Debug for EventGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventGuard")
            .field("id", &self.id)
            .field("happened", &self.guard.happened)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_event_ids_are_unique() {
        let a = CoroutineEvent::detached();
        let b = CoroutineEvent::detached();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_happen_is_fire_once() {
        let event = CoroutineEvent::detached();
        assert!(!event.is_happened());
        assert!(event.happen());
        assert!(event.is_happened());
        assert!(!event.happen());
        assert!(event.is_happened());
    }

    #[test]
    fn test_set_not_happened_allows_reuse() {
        let event = CoroutineEvent::detached();
        event.happen();
        event.set_not_happened();
        assert!(!event.is_happened());
        assert!(event.happen());
    }

    #[test]
    fn test_guard_resets_flag() {
        let event = CoroutineEvent::detached();
        event.happen();
        {
            let mut guard = event.lock();
            assert!(guard.is_happened());
            guard.set_not_happened();
            assert_eq!(guard.event_id(), event.id());
        }
        assert!(!event.is_happened());
    }

    #[test]
    fn test_happen_waits_for_lock_holder() {
        let event = CoroutineEvent::detached();
        let guard = event.lock();

        let other = event.clone();
        let handle = thread::spawn(move || other.happen());

        thread::sleep(Duration::from_millis(20));
        // Still locked: the other thread cannot have set the flag yet
        assert!(!guard.is_happened());
        drop(guard);

        assert!(handle.join().unwrap());
        assert!(event.is_happened());
    }

    #[test]
    fn test_guard_released_on_another_thread() {
        let event = CoroutineEvent::detached();
        let guard = event.lock();
        thread::spawn(move || drop(guard)).join().unwrap();
        assert!(event.happen());
    }
}
