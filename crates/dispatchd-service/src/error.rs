//! Service error types.

/// Unified error type for the dispatcher runtime.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A worker process could not be spawned.
    #[error("failed to spawn worker {worker_id}: {source}")]
    WorkerSpawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    /// The worker's command channel is gone; the process has died.
    #[error("worker {worker_id} is not accepting commands")]
    WorkerGone { worker_id: usize },

    /// Work was submitted to a pool that is shutting down.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// A worker protocol frame could not be encoded or decoded.
    #[error("worker protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// I/O failure on a worker's stdio pipes.
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the service crate.
pub type Result<T> = std::result::Result<T, ServiceError>;
