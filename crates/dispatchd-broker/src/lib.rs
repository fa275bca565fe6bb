//! Broker transports for dispatchd.
//!
//! Dispatcher messaging is swappable: the coordinator and the control client
//! only ever talk to the [`Broker`] trait, and all transport-specific code
//! lives behind it.  Two transports ship here:
//!
//! - **[`pg_notify`]** -- the reference transport: LISTEN/NOTIFY channels on
//!   a Postgres database, driven through sqlx.
//! - **[`memory`]** -- an in-process pub/sub hub used by the end-to-end tests
//!   and by embedders that run the dispatcher inside their own process.
//!
//! The [`producer`] module adapts one broker subscription into a stream of
//! calls on a [`MessageConsumer`], which both the dispatcher service and the
//! control client implement.

pub mod channel;
pub mod error;
pub mod memory;
pub mod pg_notify;
pub mod producer;

use async_trait::async_trait;

use dispatchd_core::Reply;

pub use channel::validate_channel_name;
pub use error::{BrokerError, Result};
pub use memory::{MemoryBroker, MemoryBus};
pub use pg_notify::PgBroker;
pub use producer::{BrokeredProducer, ProducerEvents};

/// The minimal interface every transport must satisfy.
///
/// Channel names are untrusted by default: implementations must reject names
/// outside `[A-Za-z0-9_]` before any statement or registry touch, on both the
/// subscribe and publish paths.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish (or reuse) the underlying connection.
    async fn connect(&self) -> Result<()>;

    /// Subscribe to the given channels.  After this returns, published
    /// messages on those channels are guaranteed to be delivered via
    /// [`Broker::recv`].
    async fn subscribe(&self, channels: &[String]) -> Result<()>;

    /// Wait for the next inbound `(channel, payload)` pair.
    async fn recv(&self) -> Result<(String, String)>;

    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Release connections.  Idempotent.
    async fn close(&self) -> Result<()>;
}

/// The consumer side of a producer: the coordinator (service side) or the
/// reply collector (client side).
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Handle one inbound payload.  A returned [`Reply`] is published by the
    /// producer on the indicated channel.
    async fn process_message(&self, payload: String, channel: Option<&str>) -> Option<Reply>;

    /// Invoked by the producer once its subscription is live.  The client
    /// uses this to publish only after the reply queue is reachable.
    async fn connected_callback(&self, broker: &dyn Broker) -> Result<()> {
        let _ = broker;
        Ok(())
    }

    /// Invoked when the producer's background task dies with an error that
    /// was not caused by shutdown.  Implementations set their exit event.
    fn fatal_error(&self, context: &str);
}
