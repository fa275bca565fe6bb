//! Client error types.

use dispatchd_broker::BrokerError;

/// Unified error type for the control client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The control was constructed without a target channel but asked to
    /// publish.
    #[error("no target channel configured for control messages")]
    NoTargetChannel,

    /// Transport-level failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A reply payload was not valid JSON.
    #[error("failed to decode control reply: {0}")]
    Decode(#[from] serde_json::Error),

    /// The private runtime for the synchronous entry points failed to build.
    #[error("failed to build client runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

/// Convenience alias used throughout the client crate.
pub type Result<T> = std::result::Result<T, ClientError>;
