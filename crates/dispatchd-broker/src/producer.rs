//! The producer layer.
//!
//! A [`BrokeredProducer`] owns one broker subscription and a background task
//! that feeds every inbound `(channel, payload)` pair to a
//! [`MessageConsumer`].  When the consumer hands back a reply tuple, the
//! producer publishes it on the same broker.
//!
//! Long-lived service producers keep their broker connections open across
//! shutdown of the producing task; short-lived ones (the client-side reply
//! receiver) set `close_on_exit` so the temporary connection is torn down
//! with the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use dispatchd_core::PulseEvent;

use crate::error::Result;
use crate::{Broker, MessageConsumer};

/// Events a producer exposes to whoever started it.
#[derive(Default)]
pub struct ProducerEvents {
    /// Set once the subscription is confirmed: from this point on, publishing
    /// to the subscribed channels is guaranteed to reach this producer.
    pub ready_event: PulseEvent,
}

/// Adapter that drives a broker subscription and feeds a consumer callback.
pub struct BrokeredProducer {
    broker: Arc<dyn Broker>,
    channels: Vec<String>,
    close_on_exit: bool,
    pub events: Arc<ProducerEvents>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl BrokeredProducer {
    pub fn new(broker: Arc<dyn Broker>, channels: Vec<String>, close_on_exit: bool) -> Self {
        Self {
            broker,
            channels,
            close_on_exit,
            events: Arc::new(ProducerEvents::default()),
            task: Mutex::new(None),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The channels this producer subscribes.
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Connect, subscribe, notify the consumer, then start the delivery task.
    ///
    /// Connection and subscription failures surface here, in the caller's
    /// context, so startup code can react before any message flows.  The
    /// consumer's `connected_callback` runs after the subscription is live
    /// and before `ready_event` is set.
    pub async fn start_producing(&self, consumer: Arc<dyn MessageConsumer>) -> Result<()> {
        self.broker.connect().await?;
        self.broker.subscribe(&self.channels).await?;
        consumer.connected_callback(self.broker.as_ref()).await?;
        self.events.ready_event.set();

        let broker = Arc::clone(&self.broker);
        let shutting_down = Arc::clone(&self.shutting_down);
        let handle = tokio::spawn(async move {
            loop {
                match broker.recv().await {
                    Ok((channel, payload)) => {
                        let reply = consumer.process_message(payload, Some(&channel)).await;
                        if let Some(reply) = reply {
                            if let Err(error) =
                                broker.publish(&reply.channel, &reply.payload).await
                            {
                                tracing::error!(
                                    channel = %reply.channel,
                                    error = %error,
                                    "failed to publish control reply"
                                );
                                if !shutting_down.load(Ordering::SeqCst) {
                                    consumer.fatal_error("reply publish failed");
                                }
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        if !shutting_down.load(Ordering::SeqCst) {
                            tracing::error!(error = %error, "producer receive failed");
                            consumer.fatal_error("broker receive failed");
                        }
                        return;
                    }
                }
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        tracing::debug!(channels = ?self.channels, "producer started");
        Ok(())
    }

    /// Stop the delivery task; close broker resources if this producer owns
    /// them.  Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
            // A JoinError here is the cancellation we just requested.
            let _ = handle.await;
        }
        if self.close_on_exit {
            if let Err(error) = self.broker.close().await {
                tracing::warn!(error = %error, "error closing producer broker");
            }
        }
        tracing::debug!(channels = ?self.channels, "producer shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dispatchd_core::Reply;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    use crate::memory::MemoryBus;

    struct RecordingConsumer {
        seen: AsyncMutex<Vec<(Option<String>, String)>>,
        reply_channel: Option<String>,
    }

    #[async_trait]
    impl MessageConsumer for RecordingConsumer {
        async fn process_message(&self, payload: String, channel: Option<&str>) -> Option<Reply> {
            self.seen
                .lock()
                .await
                .push((channel.map(str::to_string), payload.clone()));
            self.reply_channel.as_ref().map(|channel| Reply {
                channel: channel.clone(),
                payload: format!("re: {payload}"),
            })
        }

        fn fatal_error(&self, _context: &str) {}
    }

    #[tokio::test]
    async fn delivers_messages_to_consumer() {
        let bus = MemoryBus::default();
        let producer = BrokeredProducer::new(
            Arc::new(bus.broker()),
            vec!["work".to_string()],
            true,
        );
        let consumer = Arc::new(RecordingConsumer {
            seen: AsyncMutex::new(Vec::new()),
            reply_channel: None,
        });

        producer
            .start_producing(Arc::clone(&consumer) as Arc<dyn MessageConsumer>)
            .await
            .unwrap();
        assert!(producer.events.ready_event.is_set());

        bus.broker().publish("work", "payload_1").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = consumer.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (Some("work".to_string()), "payload_1".to_string()));
        drop(seen);

        producer.shutdown().await;
    }

    #[tokio::test]
    async fn publishes_consumer_replies() {
        let bus = MemoryBus::default();
        let producer = BrokeredProducer::new(
            Arc::new(bus.broker()),
            vec!["work".to_string()],
            true,
        );
        let consumer = Arc::new(RecordingConsumer {
            seen: AsyncMutex::new(Vec::new()),
            reply_channel: Some("reply_q".to_string()),
        });

        // Observe the reply channel before any message flows.
        let observer = bus.broker();
        observer.subscribe(&["reply_q".to_string()]).await.unwrap();

        producer
            .start_producing(consumer as Arc<dyn MessageConsumer>)
            .await
            .unwrap();
        bus.broker().publish("work", "ping").await.unwrap();

        let (channel, payload) =
            tokio::time::timeout(Duration::from_secs(1), observer.recv())
                .await
                .expect("reply should arrive")
                .unwrap();
        assert_eq!(channel, "reply_q");
        assert_eq!(payload, "re: ping");

        producer.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let bus = MemoryBus::default();
        let producer =
            BrokeredProducer::new(Arc::new(bus.broker()), vec!["work".to_string()], true);
        let consumer = Arc::new(RecordingConsumer {
            seen: AsyncMutex::new(Vec::new()),
            reply_channel: None,
        });
        producer
            .start_producing(consumer as Arc<dyn MessageConsumer>)
            .await
            .unwrap();
        producer.shutdown().await;
        producer.shutdown().await;
    }
}
