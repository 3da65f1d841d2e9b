// Zero-payload task notification with set-without-overwrite semantics.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Per-subsystem notification values. Code 0 is reserved as the "nothing pending" sentinel.
pub trait NotifyCode: Copy + Debug + Eq + Send + 'static {
    /// Value that asks the task to leave its loop.
    const SHUT_DOWN: Self;

    fn code(self) -> u32;
    fn from_code(code: u32) -> Option<Self>;
}

/// Notification slot owned by one task.
#[derive(Debug, Default)]
pub struct Notifier {
    value: AtomicU32,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pending value. Fails if a value is still unconsumed; the sender retries.
    pub fn notify(&self, value: u32) -> bool {
        if value == 0 {
            return false;
        }
        if self
            .value
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // Waiters check the value under this lock, so taking it here avoids a lost wakeup
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_one();
        true
    }

    /// Wait up to `timeout` for a value and clear it. Returns 0 on timeout.
    pub fn take_wait(&self, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let value = self.value.swap(0, Ordering::AcqRel);
            if value != 0 {
                return value;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            guard = self
                .wake
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn pending(&self) -> Option<u32> {
        match self.value.load(Ordering::Acquire) {
            0 => None,
            v => Some(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SHUT_DOWN: u32 = 3;
    const OTHER: u32 = 1;

    #[test]
    fn shutdown_never_overwrites_pending_value() {
        let n = Notifier::new();
        assert!(n.notify(OTHER));
        for _ in 0..100 {
            assert!(!n.notify(SHUT_DOWN));
        }
        assert_eq!(n.take_wait(Duration::ZERO), OTHER);
        assert!(n.notify(SHUT_DOWN));
        assert_eq!(n.take_wait(Duration::ZERO), SHUT_DOWN);
    }

    #[test]
    fn take_wait_returns_zero_on_timeout() {
        let n = Notifier::new();
        assert_eq!(n.take_wait(Duration::from_millis(10)), 0);
        assert!(!n.notify(0));
    }

    #[test]
    fn waiter_wakes_on_notify() {
        let n = Arc::new(Notifier::new());
        let waiter = {
            let n = n.clone();
            thread::spawn(move || n.take_wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        while !n.notify(SHUT_DOWN) {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(waiter.join().unwrap(), SHUT_DOWN);
        assert_eq!(n.pending(), None);
    }

    #[test]
    fn retrying_sender_succeeds_once_receiver_drains() {
        let n = Arc::new(Notifier::new());
        assert!(n.notify(OTHER));
        let sender = {
            let n = n.clone();
            thread::spawn(move || {
                let mut attempts = 0u32;
                while !n.notify(SHUT_DOWN) {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                attempts
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(n.take_wait(Duration::ZERO), OTHER);
        assert!(sender.join().unwrap() > 0);
        assert_eq!(n.take_wait(Duration::from_secs(1)), SHUT_DOWN);
    }
}
