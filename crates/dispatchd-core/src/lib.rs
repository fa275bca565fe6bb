//! dispatchd core types.
//!
//! This crate holds the pieces every other dispatchd crate agrees on:
//!
//! - **[`protocol`]** -- the canonical in-core message record and the
//!   `on_duplicate` policy tokens that travel on the wire as JSON.
//! - **[`config`]** -- the startup configuration snapshot, deserialized from
//!   TOML and passed explicitly to every subsystem that needs it.
//! - **[`event`]** -- a small set/wait/clear pulse event used for ready
//!   signals, work-cleared pulses and the coordinator exit event.
//! - **[`error`]** -- error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod config;
pub mod error;
pub mod event;
pub mod protocol;

pub use config::{BrokerEntry, DispatcherConfig, ForkMode, PoolConfig};
pub use error::{CoreError, Result};
pub use event::PulseEvent;
pub use protocol::{Message, OnDuplicate, Reply};
