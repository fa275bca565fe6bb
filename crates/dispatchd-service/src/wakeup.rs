//! Lazy wakeup scheduling.
//!
//! Delayed submissions, periodic schedules and timeouts all share one shape:
//! a set of objects, each able to report the next moment it needs attention,
//! and a callback to run when the soonest of those moments arrives.
//! [`NextWakeupRunner`] implements that contract with a single lazily-created
//! background task, so the rest of the code base never plumbs its own timer
//! tasks.  The only discipline required of callers: change the collection,
//! then [`NextWakeupRunner::kick`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capability to report a future moment when a call is needed.
///
/// - `None` -- no need to call the callback, ever (until state changes).
/// - A future instant -- call the callback at that time.
/// - A past instant -- call the callback right away.
pub trait HasWakeup: Send + Sync {
    fn next_wakeup(&self) -> Option<Instant>;
}

/// Async callback invoked when a deadline is due.
pub type WakeupCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wakes up at the next deadline of a wakeup source, using one lazy task.
///
/// The source is typically an aggregate (a set of delay capsules, a table of
/// schedules) whose own `next_wakeup` is the minimum over its members.  The
/// background task exists only while the source reports a deadline; it exits
/// as soon as there is nothing left to wait for and is re-created by the next
/// `kick` that finds one.
pub struct NextWakeupRunner<S: HasWakeup + ?Sized> {
    source: Arc<S>,
    callback: WakeupCallback,
    name: &'static str,
    task: Mutex<Option<JoinHandle<()>>>,
    kick_signal: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

impl<S: HasWakeup + ?Sized + 'static> NextWakeupRunner<S> {
    pub fn new(source: Arc<S>, callback: WakeupCallback, name: &'static str) -> Self {
        Self {
            source,
            callback,
            name,
            task: Mutex::new(None),
            kick_signal: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The soonest deadline the source reports, or `None` for "never".
    pub fn get_next_wakeup(&self) -> Option<Instant> {
        self.source.next_wakeup()
    }

    /// Ensure the background task runs iff there is a deadline.
    ///
    /// Call after any change to the underlying collection.  If the task is
    /// already running it is signalled to re-evaluate; if it has exited (or
    /// was never started) and a deadline exists, a fresh task is spawned.
    pub fn kick(&self) {
        if self.source.next_wakeup().is_none() {
            // No deadline, no task to manage.
            return;
        }
        let mut guard = self.task.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(handle) if !handle.is_finished() => self.kick_signal.notify_one(),
            _ => *guard = Some(self.spawn_task()),
        }
    }

    fn spawn_task(&self) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let callback = Arc::clone(&self.callback);
        let kick_signal = Arc::clone(&self.kick_signal);
        let shutting_down = Arc::clone(&self.shutting_down);
        let name = self.name;
        tokio::spawn(async move {
            tracing::debug!(runner = name, "wakeup task started");
            loop {
                if shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let Some(deadline) = source.next_wakeup() else {
                    break;
                };
                if deadline <= Instant::now() {
                    callback().await;
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = kick_signal.notified() => {}
                }
            }
            tracing::debug!(runner = name, "wakeup task exited");
        })
    }

    /// Stop the background task gracefully and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.kick_signal.notify_one();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
