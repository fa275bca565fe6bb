//! The canonical message record.
//!
//! Every payload a broker delivers is normalized into a [`Message`] before the
//! coordinator routes it.  On the wire the message is a JSON object; a payload
//! that does not decode as an object is treated as a literal task expression
//! (see [`Message::from_payload`]).
//!
//! Fields the dispatcher does not understand are preserved in
//! [`Message::extra`] and travel to the worker untouched, so publishers can
//! attach their own metadata without a schema change here.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// On-duplicate policy
// ---------------------------------------------------------------------------

/// What to do when a task arrives whose uuid is already running or staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDuplicate {
    /// Always dispatch, duplicates run side by side.
    #[default]
    Parallel,
    /// Drop the new message and count it as discarded.
    Discard,
    /// Queue the new message; at most one task with this uuid runs at a time.
    Serial,
    /// Keep at most one pending message in addition to the running one.
    /// A further arrival replaces the pending message; the displaced one is
    /// counted as discarded.
    QueueOne,
}

impl OnDuplicate {
    fn is_default(&self) -> bool {
        *self == Self::Parallel
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A control or task submission message in its canonical in-core form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    /// Task expression for the worker to run.  Optional when `control` is
    /// present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Unique task identifier.  Stamped `internal-<N>` at ingress if the
    /// publisher did not provide one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// True when `uuid` was assigned at ingress rather than supplied by the
    /// publisher.  Never on the wire; [`Message::dedup_key`] uses it to fall
    /// back to a content-derived key.
    #[serde(skip)]
    pub auto_uuid: bool,

    /// The broker channel this message arrived on.  Stamped by the
    /// dispatcher, never trusted from the publisher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Seconds to defer dispatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<f64>,

    /// Duplicate policy applied by the worker pool.
    #[serde(default, skip_serializing_if = "OnDuplicate::is_default")]
    pub on_duplicate: OnDuplicate,

    /// Control command name.  Presence diverts the message to the control
    /// handler instead of the pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<String>,

    /// Argument map passed to the control handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_data: Option<Value>,

    /// Channel name for a synchronous reply.  Absent means fire-and-forget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Publisher-supplied fields the dispatcher does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Message {
    /// Build a message that only carries a task expression.
    pub fn from_task(task: impl Into<String>) -> Self {
        Self {
            task: Some(task.into()),
            ..Self::default()
        }
    }

    /// Normalize a raw broker payload.
    ///
    /// A payload that decodes as a JSON object becomes a structured message;
    /// anything else (invalid JSON, or a JSON scalar/array) is treated as a
    /// literal task expression.
    pub fn from_payload(payload: &str) -> Self {
        match serde_json::from_str::<Message>(payload) {
            Ok(message) => message,
            Err(_) => Self::from_task(payload),
        }
    }

    /// Serialize for the wire.
    pub fn to_payload(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The key duplicate policies operate on.
    ///
    /// A publisher-supplied uuid is the key.  An auto-assigned uuid is
    /// unique per message and would never match anything, so the key falls
    /// back to the task expression plus any `args`/`kwargs` the publisher
    /// attached.  Cancellation matches on the uuid itself, never this key.
    pub fn dedup_key(&self) -> Cow<'_, str> {
        if !self.auto_uuid {
            if let Some(uuid) = self.uuid.as_deref() {
                return Cow::Borrowed(uuid);
            }
        }
        let mut key = self.task.clone().unwrap_or_default();
        for field in ["args", "kwargs"] {
            if let Some(value) = self.extra.get(field) {
                key.push(' ');
                key.push_str(&value.to_string());
            }
        }
        Cow::Owned(key)
    }

    /// True when this message is a control command rather than pool work.
    pub fn is_control(&self) -> bool {
        self.control.is_some()
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// A reply produced by a control handler, to be published by the producer
/// that delivered the originating message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Channel to publish on (the requester's temporary reply queue).
    pub channel: String,
    /// JSON payload.
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
