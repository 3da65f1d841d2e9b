// Single-slot mailbox used for request and response traffic between tasks.
// A second send while the slot is occupied fails instead of overwriting.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Slot<T> {
    item: Option<T>,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU32,
    rejected: AtomicU32,
    received: AtomicU32,
    peeked: AtomicU32,
    removed: AtomicU32,
    after_close: AtomicU32,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    posted: Condvar,
    freed: Condvar,
    counters: Counters,
}

/// Snapshot of mailbox traffic, mostly useful for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub sent: u32,
    pub rejected: u32,
    pub received: u32,
    pub peeked: u32,
    pub removed: u32,
    /// Receive/peek/remove calls made after the mailbox was closed.
    pub receiver_ops_after_close: u32,
}

/// Cloneable handle to a one-deep queue. Every clone refers to the same slot.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("Mailbox")
            .field("occupied", &slot.item.is_some())
            .field("closed", &slot.closed)
            .finish()
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    item: None,
                    closed: false,
                }),
                posted: Condvar::new(),
                freed: Condvar::new(),
                counters: Counters::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking post. Hands the item back if the slot is busy or the mailbox is closed.
    pub fn try_post(&self, item: T) -> Result<(), T> {
        let mut slot = self.lock();
        if slot.closed || slot.item.is_some() {
            self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        slot.item = Some(item);
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.inner.posted.notify_all();
        Ok(())
    }

    /// Non-blocking post; `false` means the slot was occupied and the item was dropped.
    pub fn send(&self, item: T) -> bool {
        self.try_post(item).is_ok()
    }

    /// Post, waiting up to `timeout` for the slot to free up.
    pub fn send_timeout(&self, item: T, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.closed {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            if slot.item.is_none() {
                slot.item = Some(item);
                self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
                self.inner.posted.notify_all();
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            slot = self
                .inner
                .freed
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take the queued item, waiting up to `timeout` for one to arrive.
    pub fn receive(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.wait_posted(timeout)?;
        let item = slot.item.take();
        if item.is_some() {
            self.inner.counters.received.fetch_add(1, Ordering::Relaxed);
            self.inner.freed.notify_all();
        }
        item
    }

    /// Remove the queued item without waiting. Pairs with `peek`.
    pub fn remove(&self) -> Option<T> {
        let mut slot = self.lock();
        if slot.closed {
            self.inner.counters.after_close.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let item = slot.item.take();
        if item.is_some() {
            self.inner.counters.removed.fetch_add(1, Ordering::Relaxed);
            self.inner.freed.notify_all();
        }
        item
    }

    pub fn is_occupied(&self) -> bool {
        self.lock().item.is_some()
    }

    /// Close the mailbox: pending items are dropped, waiters wake, later posts fail.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        slot.item = None;
        self.inner.posted.notify_all();
        self.inner.freed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> MailboxStats {
        let c = &self.inner.counters;
        MailboxStats {
            sent: c.sent.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            peeked: c.peeked.load(Ordering::Relaxed),
            removed: c.removed.load(Ordering::Relaxed),
            receiver_ops_after_close: c.after_close.load(Ordering::Relaxed),
        }
    }

    // Returns the locked slot once it holds an item, or None on timeout/close.
    fn wait_posted(&self, timeout: Duration) -> Option<MutexGuard<'_, Slot<T>>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.closed {
                self.inner.counters.after_close.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            if slot.item.is_some() {
                return Some(slot);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .inner
                .posted
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl<T: Clone> Mailbox<T> {
    /// Copy of the queued item, left in place so a crash mid-processing keeps it queued.
    pub fn peek(&self, timeout: Duration) -> Option<T> {
        let slot = self.wait_posted(timeout)?;
        let item = slot.item.clone();
        if item.is_some() {
            self.inner.counters.peeked.fetch_add(1, Ordering::Relaxed);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_send_fails_while_slot_busy() {
        let mb = Mailbox::new();
        assert!(mb.send(1u32));
        assert!(!mb.send(2u32));
        assert_eq!(mb.receive(Duration::ZERO), Some(1));
        assert_eq!(mb.stats().rejected, 1);
    }

    #[test]
    fn peek_leaves_item_queued() {
        let mb = Mailbox::new();
        mb.send("req");
        assert_eq!(mb.peek(Duration::ZERO), Some("req"));
        assert!(mb.is_occupied());
        assert_eq!(mb.remove(), Some("req"));
        assert!(!mb.is_occupied());
    }

    #[test]
    fn send_timeout_waits_for_slot() {
        let mb = Mailbox::new();
        mb.send(1u8);
        let rx = mb.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            rx.receive(Duration::ZERO)
        });
        assert!(mb.send_timeout(2u8, Duration::from_secs(2)));
        assert_eq!(t.join().unwrap(), Some(1));
        assert_eq!(mb.receive(Duration::ZERO), Some(2));
    }

    #[test]
    fn receive_times_out_empty() {
        let mb: Mailbox<u8> = Mailbox::new();
        let start = Instant::now();
        assert_eq!(mb.receive(Duration::from_millis(15)), None);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn closed_mailbox_rejects_and_counts_late_receivers() {
        let mb = Mailbox::new();
        mb.send(7u8);
        mb.close();
        assert!(!mb.send(8u8));
        assert!(!mb.send_timeout(8u8, Duration::from_millis(5)));
        assert_eq!(mb.receive(Duration::ZERO), None);
        assert_eq!(mb.stats().receiver_ops_after_close, 1);
    }
}
