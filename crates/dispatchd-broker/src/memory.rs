//! In-process pub/sub transport.
//!
//! [`MemoryBus`] is a cloneable hub backed by [`tokio::sync::broadcast`];
//! every [`MemoryBroker`] created from the same bus sees the same channels.
//! The end-to-end tests run a full dispatcher and control client over one
//! bus, and embedders can do the same to host the dispatcher in-process.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use crate::channel::validate_channel_name;
use crate::error::{BrokerError, Result};
use crate::Broker;

/// One published message: `(channel, payload)`.
type BusItem = (Arc<str>, Arc<str>);

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Shared in-process message hub.
///
/// Cheaply cloneable; all clones publish into and subscribe from the same
/// broadcast channel.  Payloads are wrapped in [`Arc`] so fanning out to
/// multiple subscribers does not clone the text.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusItem>,
}

impl MemoryBus {
    /// Create a bus able to buffer `capacity` undelivered messages per
    /// subscriber before lagging.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a broker handle attached to this bus.
    #[must_use]
    pub fn broker(&self) -> MemoryBroker {
        MemoryBroker {
            bus: self.clone(),
            state: Mutex::new(None),
        }
    }

    fn publish(&self, channel: &str, payload: &str) {
        // A send error just means nobody is subscribed right now; messages
        // are fire-and-forget at the transport level.
        let _ = self.sender.send((channel.into(), payload.into()));
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

struct Subscription {
    channels: HashSet<String>,
    receiver: broadcast::Receiver<BusItem>,
}

/// A [`Broker`] over a [`MemoryBus`].
pub struct MemoryBroker {
    bus: MemoryBus,
    state: Mutex<Option<Subscription>>,
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<()> {
        for name in channels {
            validate_channel_name(name)?;
        }
        let subscription = Subscription {
            channels: channels.iter().cloned().collect(),
            // The receiver only observes messages published from here on,
            // which is exactly the ready-event contract.
            receiver: self.bus.sender.subscribe(),
        };
        *self.state.lock().await = Some(subscription);
        tracing::debug!(channels = ?channels, "memory broker subscribed");
        Ok(())
    }

    async fn recv(&self) -> Result<(String, String)> {
        let mut guard = self.state.lock().await;
        let subscription = guard.as_mut().ok_or(BrokerError::NotConnected)?;
        loop {
            match subscription.receiver.recv().await {
                Ok((channel, payload)) => {
                    if subscription.channels.contains(channel.as_ref()) {
                        return Ok((channel.to_string(), payload.to_string()));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "memory broker lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BrokerError::Closed),
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        validate_channel_name(channel)?;
        self.bus.publish(channel, payload);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock().await = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
