//! Named control handlers.
//!
//! Control commands arrive in-band on the same channels as task submissions
//! and are served by the coordinator itself, never by workers.  The registry
//! is an explicit name-to-handler map: names starting with `_` are reserved
//! and never resolve, and unknown names take the error path in
//! [`crate::dispatcher::DispatcherMain::run_control_action`].
//!
//! A handler returns either a JSON object, into which the coordinator merges
//! `node_id` before the reply is published (`alive`, `shutdown`, error
//! replies), or a bare list of `[worker_id, message]` pairs that goes back
//! verbatim (`running`, `cancel`).

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::dispatcher::DispatcherMain;

/// Worker-id stand-in reported for tasks still waiting out their delay.
pub const DELAYED_WORKER_ID: &str = "<delayed>";

/// A control handler: borrows the dispatcher and the request's control_data.
pub type ControlHandler =
    for<'a> fn(&'a DispatcherMain, Option<&'a Value>) -> BoxFuture<'a, Value>;

/// Resolve an action name.  Reserved (underscore-prefixed) and unknown names
/// return `None`.
pub fn lookup(action: &str) -> Option<ControlHandler> {
    if action.starts_with('_') {
        return None;
    }
    match action {
        "alive" => Some(alive),
        "running" => Some(running),
        "cancel" => Some(cancel),
        "shutdown" => Some(shutdown),
        _ => None,
    }
}

/// Presence of the reply signals liveness; the body is empty.
fn alive<'a>(_dispatcher: &'a DispatcherMain, _data: Option<&'a Value>) -> BoxFuture<'a, Value> {
    Box::pin(async move { Value::Object(Map::new()) })
}

/// `[worker_id, message]` pairs for currently-running or delayed tasks.
fn running<'a>(dispatcher: &'a DispatcherMain, _data: Option<&'a Value>) -> BoxFuture<'a, Value> {
    Box::pin(async move {
        let mut entries = Vec::new();
        for message in dispatcher.delayed_report() {
            entries.push(json!([DELAYED_WORKER_ID, message]));
        }
        for (worker_id, message) in dispatcher.pool().running_snapshot().await {
            entries.push(json!([worker_id, message]));
        }
        Value::Array(entries)
    })
}

/// Cancel delayed and running tasks by uuid.
fn cancel<'a>(dispatcher: &'a DispatcherMain, data: Option<&'a Value>) -> BoxFuture<'a, Value> {
    Box::pin(async move {
        let uuid = data.and_then(|data| data.get("uuid")).and_then(Value::as_str);
        let Some(uuid) = uuid else {
            return json!({ "error": "cancel requires control_data with a uuid" });
        };
        let mut entries = Vec::new();
        for message in dispatcher.cancel_delayed(uuid) {
            entries.push(json!([DELAYED_WORKER_ID, message]));
        }
        for (worker_id, message) in dispatcher.pool().cancel(uuid).await {
            entries.push(json!([worker_id, message]));
        }
        Value::Array(entries)
    })
}

/// Ask the dispatcher to exit its main loop.
fn shutdown<'a>(dispatcher: &'a DispatcherMain, _data: Option<&'a Value>) -> BoxFuture<'a, Value> {
    Box::pin(async move {
        tracing::info!("shutdown requested via control command");
        dispatcher.events.exit_event.set();
        Value::Object(Map::new())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_actions_resolve() {
        for action in ["alive", "running", "cancel", "shutdown"] {
            assert!(lookup(action).is_some(), "{action} should resolve");
        }
    }

    #[test]
    fn reserved_and_unknown_names_do_not_resolve() {
        for action in ["_alive", "_anything", "does_not_exist", ""] {
            assert!(lookup(action).is_none(), "{action} should not resolve");
        }
    }
}
