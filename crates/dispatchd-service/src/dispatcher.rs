//! The coordinator.
//!
//! [`DispatcherMain`] owns the producers, the worker pool, the delayed
//! message set and its wakeup runner.  Everything it coordinates runs on one
//! tokio runtime; parallelism comes from the worker processes.  Producers
//! feed [`DispatcherMain::process_message`], the common ingress for task
//! submissions and control commands alike.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use dispatchd_broker::{BrokeredProducer, MessageConsumer};
use dispatchd_core::{Message, PulseEvent, Reply};

use crate::control_tasks;
use crate::pool::{FatalHook, WorkerPool};
use crate::wakeup::{HasWakeup, NextWakeupRunner, WakeupCallback};

// ---------------------------------------------------------------------------
// Delay capsules
// ---------------------------------------------------------------------------

/// A pending task waiting out its delay.
pub struct DelayCapsule {
    received_at: Instant,
    delay: Duration,
    message: Message,
    has_ran: AtomicBool,
}

impl DelayCapsule {
    fn new(delay_seconds: f64, message: Message) -> Self {
        let delay = Duration::try_from_secs_f64(delay_seconds).unwrap_or_else(|_| {
            tracing::warn!(delay_seconds, "unusable delay value, running immediately");
            Duration::ZERO
        });
        Self {
            received_at: Instant::now(),
            delay,
            message,
            has_ran: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn has_ran(&self) -> bool {
        self.has_ran.load(Ordering::SeqCst)
    }

    fn mark_ran(&self) {
        self.has_ran.store(true, Ordering::SeqCst);
    }
}

impl HasWakeup for DelayCapsule {
    fn next_wakeup(&self) -> Option<Instant> {
        if self.has_ran() {
            return None;
        }
        Some(self.received_at + self.delay)
    }
}

/// The live set of delay capsules; its own wakeup is the soonest member's.
#[derive(Default)]
struct DelaySet {
    capsules: StdMutex<Vec<Arc<DelayCapsule>>>,
}

impl DelaySet {
    fn add(&self, capsule: Arc<DelayCapsule>) {
        self.lock().push(capsule);
    }

    fn remove(&self, capsule: &Arc<DelayCapsule>) {
        self.lock().retain(|other| !Arc::ptr_eq(other, capsule));
    }

    fn snapshot(&self) -> Vec<Arc<DelayCapsule>> {
        self.lock().clone()
    }

    fn drain(&self) -> Vec<Arc<DelayCapsule>> {
        std::mem::take(&mut *self.lock())
    }

    /// Remove capsules with the given uuid that have not yet fired.
    fn cancel_by_uuid(&self, uuid: &str) -> Vec<Message> {
        let mut guard = self.lock();
        let mut canceled = Vec::new();
        guard.retain(|capsule| {
            let matches =
                !capsule.has_ran() && capsule.message().uuid.as_deref() == Some(uuid);
            if matches {
                canceled.push(capsule.message().clone());
            }
            !matches
        });
        canceled
    }

    fn pending_messages(&self) -> Vec<Message> {
        self.lock()
            .iter()
            .filter(|capsule| !capsule.has_ran())
            .map(|capsule| capsule.message().clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<DelayCapsule>>> {
        self.capsules.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HasWakeup for DelaySet {
    fn next_wakeup(&self) -> Option<Instant> {
        self.lock()
            .iter()
            .filter_map(|capsule| capsule.next_wakeup())
            .min()
    }
}

// ---------------------------------------------------------------------------
// DispatcherMain
// ---------------------------------------------------------------------------

/// Coordinator-wide events.
pub struct DispatcherEvents {
    /// The single coordinator-wide exit signal: set by signal handlers, the
    /// `shutdown` control, or a fatal background-task error.
    pub exit_event: PulseEvent,
}

/// The dispatcher's single-threaded event loop and its state.
pub struct DispatcherMain {
    node_id: String,
    pool: WorkerPool,
    producers: Vec<Arc<BrokeredProducer>>,
    delayed: Arc<DelaySet>,
    delayed_runner: NextWakeupRunner<DelaySet>,
    received_count: AtomicU64,
    shutting_down: AtomicBool,
    /// Held while forking workers or opening broker connections; the two must
    /// never interleave or handles end up shared across processes.
    fd_lock: Arc<Mutex<()>>,
    pub events: DispatcherEvents,
}

impl DispatcherMain {
    /// Build the coordinator around an idle pool and not-yet-started
    /// producers.
    pub fn new(
        producers: Vec<BrokeredProducer>,
        pool: WorkerPool,
        node_id: Option<String>,
    ) -> Arc<Self> {
        let node_id = node_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let delayed = Arc::new(DelaySet::default());
            let callback: WakeupCallback = {
                let weak = weak.clone();
                Arc::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(dispatcher) = weak.upgrade() {
                            dispatcher.process_delayed_tasks().await;
                        }
                    })
                })
            };
            let delayed_runner =
                NextWakeupRunner::new(Arc::clone(&delayed), callback, "delayed-task-runner");
            Self {
                node_id,
                pool,
                producers: producers.into_iter().map(Arc::new).collect(),
                delayed,
                delayed_runner,
                received_count: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                fd_lock: Arc::new(Mutex::new(())),
                events: DispatcherEvents {
                    exit_event: PulseEvent::new(),
                },
            }
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn received_count(&self) -> u64 {
        self.received_count.load(Ordering::SeqCst)
    }

    /// Set the exit flag in response to a failed background task.
    pub fn fatal_error(&self, context: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        tracing::error!(context, "fatal error from background task, exit flag set");
        self.events.exit_event.set();
    }

    // -- Ingress ------------------------------------------------------------

    /// The common ingress: normalize the payload, stamp uuid and channel,
    /// divert delayed messages, and hand the rest to the internal router.
    pub async fn process_message(&self, payload: String, channel: Option<&str>) -> Option<Reply> {
        let mut message = Message::from_payload(&payload);

        // Publishers may provide a task uuid; when they do not, assign one
        // from the receive counter.  Assigned uuids are unique per message,
        // so the duplicate policies key on message content instead.
        let receive_index = self.received_count.fetch_add(1, Ordering::SeqCst);
        if message.uuid.is_none() {
            message.uuid = Some(format!("internal-{receive_index}"));
            message.auto_uuid = true;
        }
        if let Some(channel) = channel {
            message.channel = Some(channel.to_string());
        }

        if let Some(delay) = message.delay {
            if message.is_control() && message.reply_to.is_some() {
                // The reply channel would be long gone by the time the delay
                // elapses; reject instead of silently losing the reply later.
                tracing::warn!(
                    uuid = ?message.uuid,
                    control = ?message.control,
                    "dropping delayed control message with reply_to"
                );
                return None;
            }
            self.create_delayed_task(delay, message);
            return None;
        }
        self.process_message_internal(message).await
    }

    /// Route a stamped message: control handler or worker pool.
    pub async fn process_message_internal(&self, message: Message) -> Option<Reply> {
        if let Some(action) = message.control.clone() {
            return self
                .run_control_action(
                    &action,
                    message.control_data.as_ref(),
                    message.reply_to.as_deref(),
                )
                .await;
        }
        if let Err(error) = self.pool.dispatch_task(message).await {
            tracing::error!(error = %error, "failed to dispatch task to pool");
        }
        None
    }

    /// Execute a named control action and build its reply, if one is wanted.
    pub async fn run_control_action(
        &self,
        action: &str,
        control_data: Option<&Value>,
        reply_to: Option<&str>,
    ) -> Option<Reply> {
        let mut return_data = match control_tasks::lookup(action) {
            Some(handler) => handler(self, control_data).await,
            None => {
                tracing::warn!(
                    action = %action,
                    ?control_data,
                    ?reply_to,
                    "invalid control request"
                );
                if reply_to.is_some() {
                    let mut map = Map::new();
                    map.insert(
                        "error".to_string(),
                        Value::String(format!("No control method {action}")),
                    );
                    Value::Object(map)
                } else {
                    Value::Object(Map::new())
                }
            }
        };

        // Identify the responding node in record-shaped results; list
        // results (running, cancel) go back verbatim.
        if let Value::Object(map) = &mut return_data {
            map.insert("node_id".to_string(), Value::String(self.node_id.clone()));
        }
        self.pool.note_control().await;

        let Some(reply_to) = reply_to else {
            tracing::info!(action = %action, "control action handled");
            return None;
        };
        match serde_json::to_string(&return_data) {
            Ok(payload) => {
                tracing::info!(action = %action, reply_to = %reply_to, "control action handled, sending reply");
                Some(Reply {
                    channel: reply_to.to_string(),
                    payload,
                })
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to serialize control reply");
                None
            }
        }
    }

    // -- Delayed tasks ------------------------------------------------------

    fn create_delayed_task(&self, delay: f64, message: Message) {
        let capsule = Arc::new(DelayCapsule::new(delay, message));
        tracing::info!(
            delay = ?capsule.delay(),
            uuid = ?capsule.message().uuid,
            "delaying before running task"
        );
        self.delayed.add(capsule);
        self.delayed_runner.kick();
    }

    /// Callback of the delay runner: fire every capsule whose wakeup passed.
    async fn process_delayed_tasks(&self) {
        let now = Instant::now();
        for capsule in self.delayed.snapshot() {
            let due = capsule
                .next_wakeup()
                .is_some_and(|wakeup| wakeup <= now);
            if due {
                capsule.mark_ran();
                tracing::debug!(uuid = ?capsule.message().uuid, "wakeup for delayed task");
                // Delayed replies were rejected at ingress, so no reply can
                // come back out of this call.
                let _ = self.process_message_internal(capsule.message().clone()).await;
                self.delayed.remove(&capsule);
            }
        }
    }

    /// Remove matching delayed tasks before they fire.
    pub fn cancel_delayed(&self, uuid: &str) -> Vec<Message> {
        let canceled = self.delayed.cancel_by_uuid(uuid);
        if !canceled.is_empty() {
            tracing::info!(uuid = %uuid, count = canceled.len(), "canceled delayed tasks");
            self.delayed_runner.kick();
        }
        canceled
    }

    /// Messages still waiting out their delay, for the `running` report.
    pub fn delayed_report(&self) -> Vec<Message> {
        self.delayed.pending_messages()
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Start the pool, then the producers.  Failures set the exit event.
    pub async fn start_working(self: &Arc<Self>) {
        tracing::debug!("filling the worker pool");
        let fatal: FatalHook = {
            let weak = Arc::downgrade(self);
            Arc::new(move |context: &str| {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.fatal_error(context);
                }
            })
        };
        if let Err(error) = self
            .pool
            .start_working(Arc::clone(&self.fd_lock), fatal)
            .await
        {
            tracing::error!(error = %error, "worker pool failed to start");
            self.events.exit_event.set();
        }

        tracing::debug!("starting task production");
        let consumer: Arc<dyn MessageConsumer> = Arc::clone(self) as Arc<dyn MessageConsumer>;
        // Producer startup opens broker connections; serialize against
        // worker process creation.
        let _guard = self.fd_lock.lock().await;
        for producer in &self.producers {
            if let Err(error) = producer.start_producing(Arc::clone(&consumer)).await {
                tracing::error!(error = %error, "producer failed to start");
                self.events.exit_event.set();
            }
        }
    }

    /// Resolves once every producer has confirmed its subscription.
    pub async fn wait_for_producers_ready(&self) {
        for producer in &self.producers {
            producer.events.ready_event.wait().await;
        }
    }

    /// Orderly stop: producers, delay runner, pool, exit event.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        tracing::debug!("shutting down, starting with producers");
        for producer in &self.producers {
            producer.shutdown().await;
        }

        self.delayed_runner.shutdown().await;
        for capsule in self.delayed.drain() {
            tracing::warn!(
                delay = ?capsule.delay(),
                message = ?capsule.message(),
                "abandoning delayed task due to shutdown"
            );
        }

        tracing::debug!("gracefully shutting down worker pool");
        self.pool.shutdown().await;

        tracing::debug!("setting event to exit main loop");
        self.events.exit_event.set();
    }

    fn connect_signals(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let (Ok(mut interrupt), Ok(mut terminate)) =
                    (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
                else {
                    tracing::error!("failed to install signal handlers");
                    return;
                };
                tokio::select! {
                    _ = interrupt.recv() => {}
                    _ = terminate.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::error!("failed to install signal handler");
                    return;
                }
            }
            tracing::warn!("received exit signal");
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.events.exit_event.set();
            }
        });
    }

    /// Run until the exit event fires, then shut everything down.
    pub async fn main(self: &Arc<Self>) {
        self.connect_signals();
        self.start_working().await;

        tracing::info!(
            node_id = %self.node_id,
            "dispatcher running forever, or until shutdown command"
        );
        self.events.exit_event.wait().await;

        self.shutdown().await;
        tracing::debug!("dispatcher loop fully completed");
    }
}

#[async_trait]
impl MessageConsumer for DispatcherMain {
    async fn process_message(&self, payload: String, channel: Option<&str>) -> Option<Reply> {
        DispatcherMain::process_message(self, payload, channel).await
    }

    fn fatal_error(&self, context: &str) {
        DispatcherMain::fatal_error(self, context);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::InProcessSpawner;

    fn test_dispatcher() -> Arc<DispatcherMain> {
        let pool = WorkerPool::new(Arc::new(InProcessSpawner), 2);
        DispatcherMain::new(Vec::new(), pool, Some("test-node".to_string()))
    }

    async fn started_dispatcher() -> Arc<DispatcherMain> {
        let dispatcher = test_dispatcher();
        dispatcher.start_working().await;
        dispatcher
    }

    async fn wait_cleared(dispatcher: &DispatcherMain) {
        let events = dispatcher.pool().events();
        tokio::time::timeout(Duration::from_secs(3), events.work_cleared.wait())
            .await
            .expect("work should clear in time");
    }

    #[tokio::test]
    async fn bare_payload_runs_with_internal_uuid() {
        let dispatcher = started_dispatcher().await;
        let reply = dispatcher.process_message("noop".to_string(), None).await;
        assert!(reply.is_none());
        wait_cleared(&dispatcher).await;
        assert_eq!(dispatcher.pool().finished_count(), 1);
        assert_eq!(dispatcher.received_count(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn channel_is_stamped_by_the_dispatcher() {
        let dispatcher = started_dispatcher().await;
        dispatcher
            .process_message(
                r#"{"task": "sleep 0.3", "uuid": "stamped", "channel": "forged"}"#.to_string(),
                Some("real_channel"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let running = dispatcher.pool().running_snapshot().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].1.channel.as_deref(), Some("real_channel"));
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn alive_reply_carries_only_node_id() {
        let dispatcher = started_dispatcher().await;
        let reply = dispatcher
            .run_control_action("alive", None, Some("reply_q"))
            .await
            .expect("alive with reply_to should produce a reply");
        assert_eq!(reply.channel, "reply_q");
        let body: Value = serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(body, serde_json::json!({"node_id": "test-node"}));
        assert_eq!(dispatcher.pool().control_count(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_and_reserved_controls_take_the_error_path() {
        let dispatcher = started_dispatcher().await;

        let reply = dispatcher
            .run_control_action("bogus", None, Some("reply_q"))
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(body["error"], "No control method bogus");
        assert_eq!(body["node_id"], "test-node");

        let reply = dispatcher
            .run_control_action("_alive", None, Some("reply_q"))
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&reply.payload).unwrap();
        assert_eq!(body["error"], "No control method _alive");

        // Without reply_to the bad action is logged and dropped.
        let reply = dispatcher.run_control_action("bogus", None, None).await;
        assert!(reply.is_none());
        assert_eq!(dispatcher.pool().control_count(), 3);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_task_reports_then_runs() {
        let dispatcher = started_dispatcher().await;
        dispatcher
            .process_message(
                r#"{"task": "noop", "uuid": "delay_task", "delay": 0.2}"#.to_string(),
                None,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let delayed = dispatcher.delayed_report();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].uuid.as_deref(), Some("delay_task"));
        assert_eq!(dispatcher.pool().finished_count(), 0);

        wait_cleared(&dispatcher).await;
        assert_eq!(dispatcher.pool().finished_count(), 1);
        assert!(dispatcher.delayed_report().is_empty());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn canceled_delayed_task_never_runs() {
        let dispatcher = started_dispatcher().await;
        dispatcher
            .process_message(
                r#"{"task": "noop", "uuid": "doomed", "delay": 0.8}"#.to_string(),
                None,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let reply = dispatcher
            .run_control_action(
                "cancel",
                Some(&serde_json::json!({"uuid": "doomed"})),
                Some("reply_q"),
            )
            .await
            .unwrap();
        let body: Value = serde_json::from_str(&reply.payload).unwrap();
        assert!(body.is_array(), "cancel replies with a bare list");
        assert_eq!(body[0][0], control_tasks::DELAYED_WORKER_ID);
        assert_eq!(body[0][1]["uuid"], "doomed");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(dispatcher.delayed_report().is_empty());
        assert_eq!(dispatcher.pool().finished_count(), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_control_with_reply_is_rejected_at_ingress() {
        let dispatcher = started_dispatcher().await;
        let reply = dispatcher
            .process_message(
                r#"{"control": "alive", "reply_to": "reply_q", "delay": 0.01}"#.to_string(),
                None,
            )
            .await;
        assert!(reply.is_none());
        assert!(dispatcher.delayed_report().is_empty());
        assert_eq!(dispatcher.received_count(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_delayed_tasks() {
        let dispatcher = started_dispatcher().await;
        dispatcher
            .process_message(
                r#"{"task": "noop", "uuid": "abandoned", "delay": 30.0}"#.to_string(),
                None,
            )
            .await;
        dispatcher.shutdown().await;
        assert!(dispatcher.delayed_report().is_empty());
        assert_eq!(dispatcher.pool().finished_count(), 0);
        assert!(dispatcher.events.exit_event.is_set());
    }
}
