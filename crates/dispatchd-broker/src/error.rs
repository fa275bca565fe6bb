//! Broker error types.

/// Unified error type for broker transports and producers.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// A channel name contains characters outside `[A-Za-z0-9_]`.
    #[error("invalid channel name `{name}`: only [A-Za-z0-9_] is allowed")]
    InvalidChannel { name: String },

    /// An operation was attempted before `connect` or `subscribe`.
    #[error("broker is not connected")]
    NotConnected,

    /// The transport has shut down and will deliver no more messages.
    #[error("broker channel closed")]
    Closed,

    /// Database-level failure from the pg_notify transport.
    #[error("postgres error: {0}")]
    Database(#[from] sqlx::Error),

    /// The producer failed to start its subscription.
    #[error("producer failed to start: {reason}")]
    ProducerStart { reason: String },
}

/// Convenience alias used throughout the broker crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
