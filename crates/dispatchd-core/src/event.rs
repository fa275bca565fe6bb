//! Set/wait/clear pulse event.
//!
//! The coordinator signals several conditions this way: producer readiness,
//! pool idleness (`work_cleared`), and the service-wide exit event.  The
//! shape is the classic manual-reset event: `set` wakes every current and
//! future waiter until someone calls `clear`.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A manual-reset event for single-process coordination.
#[derive(Debug, Default)]
pub struct PulseEvent {
    set: AtomicBool,
    notify: Notify,
}

impl PulseEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the event and wake all waiters.  Idempotent.
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Reset the event so future `wait` calls block again.
    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the event is set.  Returns immediately if already set.
    pub async fn wait(&self) {
        loop {
            // Register interest before re-checking the flag so a concurrent
            // `set` between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}
