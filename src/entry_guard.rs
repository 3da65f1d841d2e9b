// Binary "ready for use" guard around a peripheral object.
// Held while the object is constructed or torn down, available in steady-state Run.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    available: Mutex<bool>,
    changed: Condvar,
}

/// Non-recursive binary semaphore. Clones share the same guard.
#[derive(Debug, Clone)]
pub struct EntryGuard {
    state: Arc<State>,
}

impl Default for EntryGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryGuard {
    /// New guard in the available state.
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                available: Mutex::new(true),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.state
            .available
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the guard. `None` waits forever.
    pub fn take(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut available = self.lock();
        loop {
            if *available {
                *available = false;
                return true;
            }
            available = match deadline {
                None => self
                    .state
                    .changed
                    .wait(available)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.state
                        .changed
                        .wait_timeout(available, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    pub fn try_take(&self) -> bool {
        self.take(Some(Duration::ZERO))
    }

    /// Release the guard. Returns false if it was already available (binary, never counted).
    pub fn give(&self) -> bool {
        let mut available = self.lock();
        if *available {
            return false;
        }
        *available = true;
        self.state.changed.notify_one();
        true
    }

    /// Take over a hold placed by another task.
    ///
    /// Used by the destroying task once the driving task has exited: a hold left by the
    /// asynchronous initializer (init never finished) passes to the destroyer, and a guard
    /// that was available is claimed. Either way it stays held from here on.
    /// Returns true if another task was holding it.
    pub fn transfer_ownership(&self) -> bool {
        let mut available = self.lock();
        let was_held = !*available;
        *available = false;
        was_held
    }

    pub fn is_available(&self) -> bool {
        *self.lock()
    }
}
