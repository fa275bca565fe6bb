//! Control client for a running dispatcher.
//!
//! A [`Control`] publishes control commands on a target channel and, for the
//! request/reply entry points, collects replies on a temporary reply queue
//! subscribed through a fresh broker.  The publish is gated on the reply
//! subscription being live, so a reply can never be lost to a race between
//! publishing and subscribing.
//!
//! Both async (`acontrol`, `acontrol_with_reply`) and synchronous (`control`,
//! `control_with_reply`) entry points are provided; the synchronous pair
//! drives the async pair on a private current-thread runtime and must not be
//! called from inside an async context.

pub mod error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use dispatchd_broker::{Broker, BrokeredProducer, MessageConsumer};
use dispatchd_core::{PulseEvent, Reply};

pub use error::{ClientError, Result};

/// Creates a fresh broker connection per call.
///
/// Request/reply needs two independent subscriptions (the service's and the
/// reply queue's), so the client never holds a long-lived broker of its own.
pub type BrokerFactory = Arc<dyn Fn() -> Arc<dyn Broker> + Send + Sync>;

// ---------------------------------------------------------------------------
// Reply collection
// ---------------------------------------------------------------------------

struct ControlEvents {
    exit_event: PulseEvent,
}

/// Consumer for the reply-queue producer.
///
/// Mirrors the coordinator's consumer shape: it publishes the outbound
/// control message from `connected_callback` (guaranteeing the subscription
/// is live first) and collects reply payloads until the expected count is
/// reached.
struct ControlCallbacks {
    queuename: String,
    send_payload: String,
    expected_replies: usize,
    received_replies: Mutex<Vec<String>>,
    events: ControlEvents,
    shutting_down: AtomicBool,
}

impl ControlCallbacks {
    fn new(queuename: String, send_payload: String, expected_replies: usize) -> Self {
        Self {
            queuename,
            send_payload,
            expected_replies,
            received_replies: Mutex::new(Vec::new()),
            events: ControlEvents {
                exit_event: PulseEvent::new(),
            },
            shutting_down: AtomicBool::new(false),
        }
    }

    fn take_replies(&self) -> Vec<String> {
        std::mem::take(&mut *self.received_replies.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn reply_count(&self) -> usize {
        self.received_replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl MessageConsumer for ControlCallbacks {
    async fn process_message(&self, payload: String, _channel: Option<&str>) -> Option<Reply> {
        let count = {
            let mut replies = self
                .received_replies
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            replies.push(payload);
            replies.len()
        };
        if self.expected_replies > 0 && count >= self.expected_replies {
            self.events.exit_event.set();
        }
        None
    }

    async fn connected_callback(&self, broker: &dyn Broker) -> dispatchd_broker::Result<()> {
        broker.publish(&self.queuename, &self.send_payload).await?;
        tracing::info!(channel = %self.queuename, "sent control message, expecting replies soon");
        Ok(())
    }

    fn fatal_error(&self, context: &str) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        tracing::error!(context, "control producer failed, exit flag set");
        self.events.exit_event.set();
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// Client-side handle for issuing control commands against a dispatcher.
#[derive(Clone)]
pub struct Control {
    factory: BrokerFactory,
    queuename: Option<String>,
}

impl Control {
    pub fn new(factory: BrokerFactory, queue: Option<String>) -> Self {
        Self {
            factory,
            queuename: queue,
        }
    }

    /// A fresh reply-queue name within the permitted channel alphabet.
    #[must_use]
    pub fn generate_reply_queue_name() -> String {
        format!(
            "reply_to_{}",
            uuid::Uuid::new_v4().to_string().replace('-', "_")
        )
    }

    fn target_channel(&self) -> Result<&str> {
        self.queuename
            .as_deref()
            .ok_or(ClientError::NoTargetChannel)
    }

    fn build_payload(command: &str, reply_to: Option<&str>, data: Option<Value>) -> String {
        let mut send_data = json!({ "control": command });
        if let Some(reply_to) = reply_to {
            send_data["reply_to"] = Value::String(reply_to.to_string());
        }
        if let Some(data) = data {
            send_data["control_data"] = data;
        }
        send_data.to_string()
    }

    // -- Async entry points -------------------------------------------------

    /// Fire-and-forget: publish the control message and return.
    pub async fn acontrol(&self, command: &str, data: Option<Value>) -> Result<()> {
        let payload = Self::build_payload(command, None, data);
        let broker = (self.factory)();
        broker.connect().await?;
        broker.publish(self.target_channel()?, &payload).await?;
        broker.close().await?;
        Ok(())
    }

    /// Request/reply: collect up to `expected_replies` replies or until
    /// `timeout` elapses, whichever comes first.  Partial results are
    /// returned with a warning, never an error.
    pub async fn acontrol_with_reply(
        &self,
        command: &str,
        expected_replies: usize,
        timeout: Duration,
        data: Option<Value>,
    ) -> Result<Vec<Value>> {
        let start = Instant::now();
        let reply_queue = Self::generate_reply_queue_name();
        let payload = Self::build_payload(command, Some(&reply_queue), data);
        let target = self.target_channel()?.to_string();

        let producer = BrokeredProducer::new((self.factory)(), vec![reply_queue], true);
        let callbacks = Arc::new(ControlCallbacks::new(target, payload, expected_replies));

        producer
            .start_producing(Arc::clone(&callbacks) as Arc<dyn MessageConsumer>)
            .await?;
        producer.events.ready_event.wait().await;

        if tokio::time::timeout(timeout, callbacks.events.exit_event.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                command = %command,
                expected = expected_replies,
                received = callbacks.reply_count(),
                "timed out waiting for control replies"
            );
        }

        callbacks.shutting_down.store(true, Ordering::SeqCst);
        producer.shutdown().await;

        let replies = callbacks
            .take_replies()
            .iter()
            .map(|payload| serde_json::from_str(payload))
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        tracing::info!(
            command = %command,
            elapsed = ?start.elapsed(),
            replies = replies.len(),
            "control-and-reply returned"
        );
        Ok(replies)
    }

    // -- Synchronous entry points -------------------------------------------

    /// Synchronous fire-and-forget.  Only for no-reply control.
    pub fn control(&self, command: &str, data: Option<Value>) -> Result<()> {
        Self::sync_runtime()?.block_on(self.acontrol(command, data))
    }

    /// Synchronous request/reply.
    pub fn control_with_reply(
        &self,
        command: &str,
        expected_replies: usize,
        timeout: Duration,
        data: Option<Value>,
    ) -> Result<Vec<Value>> {
        tracing::info!(command = %command, queue = ?self.queuename, "control-and-reply");
        Self::sync_runtime()?
            .block_on(self.acontrol_with_reply(command, expected_replies, timeout, data))
    }

    fn sync_runtime() -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
