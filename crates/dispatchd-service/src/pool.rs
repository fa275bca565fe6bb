//! The worker pool.
//!
//! The pool accepts dispatch requests from the coordinator, enforces the
//! per-uuid duplicate policy, routes messages to free workers, and keeps the
//! books as finished events drain back.  Internally it is one mutex-guarded
//! state record (slots plus a staged queue) and a reader task that pumps the
//! shared finished channel; parallelism lives in the workers, not here.
//!
//! # Duplicate policies
//!
//! Policies key on the message uuid.  `parallel` always dispatches;
//! `discard` drops a message whose key is already running or staged;
//! `serial` stages behind the running copy so at most one runs at a time;
//! `queue_one` keeps at most one pending copy, the newest arrival replacing
//! the pending one (the displaced message is counted as discarded).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use dispatchd_core::{Message, OnDuplicate, PulseEvent};

use crate::error::{Result, ServiceError};
use crate::process::{ProcessSpawner, WorkerCommand, WorkerEvent, WorkerHandle};

/// Hook invoked when a pool background task hits an unrecoverable error.
/// The coordinator wires this to its exit event.
pub type FatalHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Worker-id stand-in used for canceled tasks that never reached a worker.
pub const STAGED_WORKER_ID: &str = "<staged>";

/// Events the pool exposes to observers.
#[derive(Default)]
pub struct PoolEvents {
    /// Pulses whenever the pool transitions to idle: no running task and no
    /// staged task.  Observers clear it between waits.
    pub work_cleared: PulseEvent,
}

struct Slot {
    handle: WorkerHandle,
    current: Option<Message>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<usize, Slot>,
    staged: VecDeque<Message>,
}

fn key_running(slots: &HashMap<usize, Slot>, key: &str) -> bool {
    slots
        .values()
        .any(|slot| slot.current.as_ref().is_some_and(|m| m.dedup_key() == key))
}

fn key_staged(staged: &VecDeque<Message>, key: &str) -> bool {
    staged.iter().any(|m| m.dedup_key() == key)
}

struct PoolInner {
    spawner: Arc<dyn ProcessSpawner>,
    max_workers: usize,
    state: Mutex<PoolState>,
    events: Arc<PoolEvents>,
    finished_count: AtomicU64,
    canceled_count: AtomicU64,
    discarded_count: AtomicU64,
    control_count: AtomicU64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    read_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Bounded set of worker slots plus the routing logic that feeds them.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across tasks.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, max_workers: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner {
                spawner,
                max_workers,
                state: Mutex::new(PoolState::default()),
                events: Arc::new(PoolEvents::default()),
                finished_count: AtomicU64::new(0),
                canceled_count: AtomicU64::new(0),
                discarded_count: AtomicU64::new(0),
                control_count: AtomicU64::new(0),
                events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
                read_task: std::sync::Mutex::new(None),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn events(&self) -> Arc<PoolEvents> {
        Arc::clone(&self.inner.events)
    }

    pub fn finished_count(&self) -> u64 {
        self.inner.finished_count.load(Ordering::SeqCst)
    }

    pub fn canceled_count(&self) -> u64 {
        self.inner.canceled_count.load(Ordering::SeqCst)
    }

    pub fn discarded_count(&self) -> u64 {
        self.inner.discarded_count.load(Ordering::SeqCst)
    }

    pub fn control_count(&self) -> u64 {
        self.inner.control_count.load(Ordering::SeqCst)
    }

    /// Spin up the worker slots and the finished-event reader.
    ///
    /// `fd_lock` is held across every process launch (including respawns), so
    /// no broker connection is opened while a worker is being created.
    pub async fn start_working(
        &self,
        fd_lock: Arc<Mutex<()>>,
        fatal: FatalHook,
    ) -> Result<()> {
        let receiver = self
            .inner
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(receiver) = receiver else {
            tracing::warn!("worker pool already started");
            return Ok(());
        };

        {
            let _guard = fd_lock.lock().await;
            let mut state = self.inner.state.lock().await;
            for worker_id in 0..self.inner.max_workers {
                let handle = self
                    .inner
                    .spawner
                    .spawn(worker_id, self.inner.events_tx.clone())
                    .await?;
                state.slots.insert(
                    worker_id,
                    Slot {
                        handle,
                        current: None,
                    },
                );
            }
        }
        tracing::info!(workers = self.inner.max_workers, "worker pool started");

        let pool = self.clone();
        let task = tokio::spawn(pool.read_results(receiver, fd_lock, fatal));
        *self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        Ok(())
    }

    /// Enqueue a message for execution according to its duplicate policy.
    pub async fn dispatch_task(&self, message: Message) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(ServiceError::PoolShutdown);
        }
        let mut state = self.inner.state.lock().await;
        let key = message.dedup_key().into_owned();

        match message.on_duplicate {
            OnDuplicate::Parallel | OnDuplicate::Serial => {}
            OnDuplicate::Discard => {
                if key_running(&state.slots, &key) || key_staged(&state.staged, &key) {
                    drop(state);
                    self.inner.discarded_count.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(uuid = %key, "discarding duplicate task");
                    return Ok(());
                }
            }
            OnDuplicate::QueueOne => {
                if key_running(&state.slots, &key) {
                    if let Some(pos) =
                        state.staged.iter().position(|m| m.dedup_key() == key)
                    {
                        tracing::info!(uuid = %key, "replacing pending copy of queue_one task");
                        state.staged[pos] = message;
                        drop(state);
                        self.inner.discarded_count.fetch_add(1, Ordering::SeqCst);
                    } else {
                        state.staged.push_back(message);
                    }
                    return Ok(());
                }
            }
        }

        state.staged.push_back(message);
        self.pump(&mut state);
        Ok(())
    }

    /// Assign staged messages to free workers while policy permits.
    fn pump(&self, state: &mut PoolState) {
        loop {
            if !state.slots.values().any(|slot| slot.current.is_none()) {
                return;
            }
            let pos = {
                let slots = &state.slots;
                state.staged.iter().position(|m| match m.on_duplicate {
                    OnDuplicate::Serial | OnDuplicate::QueueOne => {
                        !key_running(slots, &m.dedup_key())
                    }
                    OnDuplicate::Parallel | OnDuplicate::Discard => true,
                })
            };
            let Some(pos) = pos else { return };
            let Some(message) = state.staged.remove(pos) else {
                return;
            };
            let slot = state
                .slots
                .values_mut()
                .find(|slot| slot.current.is_none());
            let Some(slot) = slot else {
                state.staged.push_front(message);
                return;
            };
            tracing::debug!(
                worker_id = slot.handle.worker_id(),
                uuid = %message.dedup_key(),
                "dispatching task to worker"
            );
            if slot
                .handle
                .send(WorkerCommand::Task {
                    message: message.clone(),
                })
                .is_ok()
            {
                slot.current = Some(message);
            } else {
                // The worker died; its exit event will respawn the slot and
                // re-pump.  Keep the message at the head of the line.
                tracing::warn!(
                    worker_id = slot.handle.worker_id(),
                    "worker not accepting work, restaging message"
                );
                state.staged.push_front(message);
                return;
            }
        }
    }

    fn check_idle(&self, state: &PoolState) {
        if state.staged.is_empty() && state.slots.values().all(|slot| slot.current.is_none()) {
            tracing::debug!("work cleared, pool idle");
            self.inner.events.work_cleared.set();
        }
    }

    async fn read_results(
        self,
        mut receiver: mpsc::UnboundedReceiver<WorkerEvent>,
        fd_lock: Arc<Mutex<()>>,
        fatal: FatalHook,
    ) {
        while let Some(event) = receiver.recv().await {
            match event {
                WorkerEvent::Finished(finished) => {
                    let mut state = self.inner.state.lock().await;
                    if let Some(slot) = state.slots.get_mut(&finished.worker_id) {
                        match slot.current.take() {
                            Some(current)
                                if current.uuid.as_deref()
                                    == Some(finished.uuid.as_str()) => {}
                            Some(current) => tracing::warn!(
                                worker_id = finished.worker_id,
                                expected = ?current.uuid,
                                got = %finished.uuid,
                                "finished event does not match the assigned task"
                            ),
                            None => tracing::warn!(
                                worker_id = finished.worker_id,
                                uuid = %finished.uuid,
                                "finished event from an idle worker"
                            ),
                        }
                    }
                    self.inner.finished_count.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(
                        worker_id = finished.worker_id,
                        uuid = %finished.uuid,
                        outcome = ?finished.outcome,
                        "task finished"
                    );
                    self.pump(&mut state);
                    self.check_idle(&state);
                }
                WorkerEvent::Exited { worker_id } => {
                    if self.inner.shutting_down.load(Ordering::SeqCst) {
                        self.inner.state.lock().await.slots.remove(&worker_id);
                        continue;
                    }
                    let interrupted = {
                        let mut state = self.inner.state.lock().await;
                        let interrupted = state
                            .slots
                            .get_mut(&worker_id)
                            .and_then(|slot| slot.current.take());
                        state.slots.remove(&worker_id);
                        interrupted
                    };
                    if let Some(message) = interrupted {
                        self.inner.canceled_count.fetch_add(1, Ordering::SeqCst);
                        tracing::info!(
                            worker_id,
                            uuid = ?message.uuid,
                            "worker exited mid-task, counted as canceled"
                        );
                    } else {
                        tracing::warn!(worker_id, "idle worker exited, respawning");
                    }
                    let respawned = {
                        let _guard = fd_lock.lock().await;
                        self.inner
                            .spawner
                            .spawn(worker_id, self.inner.events_tx.clone())
                            .await
                    };
                    match respawned {
                        Ok(handle) => {
                            let mut state = self.inner.state.lock().await;
                            state.slots.insert(
                                worker_id,
                                Slot {
                                    handle,
                                    current: None,
                                },
                            );
                            self.pump(&mut state);
                            self.check_idle(&state);
                        }
                        Err(error) => {
                            tracing::error!(worker_id, error = %error, "failed to respawn worker");
                            fatal("worker respawn failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Cancel tasks with the given uuid, staged or running.
    ///
    /// Matching is on the uuid itself (not the duplicate-policy key).
    /// Staged copies are removed and counted immediately; running copies get
    /// their worker terminated, and the finished-event drainer translates the
    /// resulting exit into the canceled count.  Returns
    /// `[worker_id, message]` pairs for everything canceled, with
    /// [`STAGED_WORKER_ID`] standing in for messages that never reached a
    /// worker.
    pub async fn cancel(&self, uuid: &str) -> Vec<(Value, Message)> {
        let mut canceled = Vec::new();
        let mut state = self.inner.state.lock().await;

        let mut kept = VecDeque::with_capacity(state.staged.len());
        for message in state.staged.drain(..) {
            if message.uuid.as_deref() == Some(uuid) {
                self.inner.canceled_count.fetch_add(1, Ordering::SeqCst);
                tracing::info!(uuid = %uuid, "canceled staged task");
                canceled.push((Value::from(STAGED_WORKER_ID), message));
            } else {
                kept.push_back(message);
            }
        }
        state.staged = kept;

        let mut worker_ids: Vec<usize> = state.slots.keys().copied().collect();
        worker_ids.sort_unstable();
        for worker_id in worker_ids {
            let Some(slot) = state.slots.get(&worker_id) else {
                continue;
            };
            if let Some(message) = slot
                .current
                .as_ref()
                .filter(|m| m.uuid.as_deref() == Some(uuid))
                .cloned()
            {
                tracing::info!(worker_id, uuid = %uuid, "terminating worker to cancel task");
                slot.handle.terminate().await;
                canceled.push((Value::from(worker_id as u64), message));
            }
        }

        self.check_idle(&state);
        canceled
    }

    /// `[worker_id, message]` pairs for currently-running tasks, ordered by
    /// worker id.
    pub async fn running_snapshot(&self) -> Vec<(usize, Message)> {
        let state = self.inner.state.lock().await;
        let mut running: Vec<(usize, Message)> = state
            .slots
            .iter()
            .filter_map(|(worker_id, slot)| {
                slot.current.clone().map(|message| (*worker_id, message))
            })
            .collect();
        running.sort_by_key(|(worker_id, _)| *worker_id);
        running
    }

    /// Record a handled control action and re-check idleness: serving a
    /// control command is itself observable work completion.
    pub async fn note_control(&self) {
        self.inner.control_count.fetch_add(1, Ordering::SeqCst);
        let state = self.inner.state.lock().await;
        self.check_idle(&state);
    }

    /// Stop accepting work, stop or kill workers, join them, stop the reader.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("shutting down worker pool");

        let (handles, abandoned) = {
            let mut state = self.inner.state.lock().await;
            let abandoned = state.staged.len();
            state.staged.clear();
            let handles: Vec<(WorkerHandle, bool)> = state
                .slots
                .values()
                .map(|slot| (slot.handle.clone(), slot.current.is_some()))
                .collect();
            (handles, abandoned)
        };
        if abandoned > 0 {
            tracing::warn!(count = abandoned, "dropping staged tasks at shutdown");
        }

        for (handle, busy) in &handles {
            if *busy {
                handle.terminate().await;
            } else {
                handle.stop();
            }
        }
        for (handle, _) in &handles {
            if !handle.join(Duration::from_secs(5)).await {
                tracing::warn!(
                    worker_id = handle.worker_id(),
                    "worker did not exit within the grace period, killing"
                );
                handle.terminate().await;
                let _ = handle.join(Duration::from_secs(1)).await;
            }
        }

        let task = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.inner.state.lock().await.slots.clear();
        tracing::debug!("worker pool shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::InProcessSpawner;

    fn test_pool(max_workers: usize) -> WorkerPool {
        WorkerPool::new(Arc::new(InProcessSpawner), max_workers)
    }

    fn noop_fatal() -> FatalHook {
        Arc::new(|_context| {})
    }

    fn task(expr: &str, uuid: &str, on_duplicate: OnDuplicate) -> Message {
        let mut message = Message::from_task(expr);
        message.uuid = Some(uuid.to_string());
        message.on_duplicate = on_duplicate;
        message
    }

    async fn wait_cleared(pool: &WorkerPool) {
        tokio::time::timeout(Duration::from_secs(3), pool.events().work_cleared.wait())
            .await
            .expect("pool should clear work in time");
    }

    #[tokio::test]
    async fn no_op_task_clears_work() {
        let pool = test_pool(1);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.dispatch_task(task("noop", "n1", OnDuplicate::Parallel))
            .await
            .unwrap();
        wait_cleared(&pool).await;
        assert_eq!(pool.finished_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn fifteen_sleeps_across_four_workers() {
        let pool = test_pool(4);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        for i in 0..15 {
            pool.dispatch_task(task("sleep 0.01", &format!("s{i}"), OnDuplicate::Parallel))
                .await
                .unwrap();
        }
        wait_cleared(&pool).await;
        assert_eq!(pool.finished_count(), 15);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn discard_drops_duplicates() {
        let pool = test_pool(2);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.2", "dup", OnDuplicate::Discard))
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.2", "dup", OnDuplicate::Discard))
            .await
            .unwrap();
        wait_cleared(&pool).await;
        assert_eq!(pool.finished_count(), 1);
        assert_eq!(pool.discarded_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn discard_keys_on_content_for_auto_assigned_uuids() {
        let pool = test_pool(2);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();

        // Two submissions without a publisher uuid: ingress stamps distinct
        // internal ids, but the policy must still see them as duplicates.
        let mut first = task("sleep 0.2", "internal-0", OnDuplicate::Discard);
        first.auto_uuid = true;
        let mut second = task("sleep 0.2", "internal-1", OnDuplicate::Discard);
        second.auto_uuid = true;

        pool.dispatch_task(first).await.unwrap();
        pool.dispatch_task(second).await.unwrap();
        wait_cleared(&pool).await;

        assert_eq!(pool.finished_count(), 1);
        assert_eq!(pool.discarded_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn serial_runs_one_at_a_time() {
        let pool = test_pool(4);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.1", "ser", OnDuplicate::Serial))
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.1", "ser", OnDuplicate::Serial))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Plenty of free workers, but only one copy may run.
        assert_eq!(pool.running_snapshot().await.len(), 1);

        // The pool only goes idle once the second copy has run too.
        wait_cleared(&pool).await;
        assert_eq!(pool.finished_count(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn queue_one_replaces_the_pending_copy() {
        let pool = test_pool(2);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.15", "q1", OnDuplicate::QueueOne))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.dispatch_task(task("sleep 0.01", "q1", OnDuplicate::QueueOne))
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.01", "q1", OnDuplicate::QueueOne))
            .await
            .unwrap();

        wait_cleared(&pool).await;
        assert_eq!(pool.discarded_count(), 1);
        // First run plus exactly one queued copy.
        let final_count = pool.finished_count();
        assert_eq!(final_count, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_running_task_counts_canceled() {
        let pool = test_pool(2);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 3.14", "foobar", OnDuplicate::Parallel))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let canceled = pool.cancel("foobar").await;
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].1.uuid.as_deref(), Some("foobar"));

        wait_cleared(&pool).await;
        assert_eq!(pool.finished_count(), 0);
        assert_eq!(pool.canceled_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_staged_task_removes_it() {
        let pool = test_pool(1);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.dispatch_task(task("sleep 0.3", "runner", OnDuplicate::Parallel))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.dispatch_task(task("sleep 0.3", "waiting", OnDuplicate::Parallel))
            .await
            .unwrap();

        let canceled = pool.cancel("waiting").await;
        assert_eq!(canceled.len(), 1);
        assert_eq!(canceled[0].0, Value::from(STAGED_WORKER_ID));
        assert_eq!(pool.canceled_count(), 1);

        wait_cleared(&pool).await;
        assert_eq!(pool.finished_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_is_rejected() {
        let pool = test_pool(1);
        pool.start_working(Arc::new(Mutex::new(())), noop_fatal())
            .await
            .unwrap();
        pool.shutdown().await;
        let result = pool
            .dispatch_task(task("noop", "late", OnDuplicate::Parallel))
            .await;
        assert!(matches!(result, Err(ServiceError::PoolShutdown)));
    }
}
