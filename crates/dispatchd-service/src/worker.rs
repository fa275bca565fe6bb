//! The worker loop body.
//!
//! A worker consumes [`WorkerCommand`] frames from its message queue and
//! reports a [`FinishedEvent`] per task on the finished queue.  Task payloads
//! are small expressions rather than arbitrary code: the dispatcher ships no
//! task registry of its own, and per-message failures must never take the
//! worker down, so everything unrecognized completes as an error result.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use dispatchd_core::Message;

use crate::error::Result;
use crate::process::{FinishedEvent, TaskOutcome, WorkerCommand, WorkerEvent};

/// Run one task message to completion.
pub async fn execute(worker_id: usize, message: &Message) -> FinishedEvent {
    let uuid = message.uuid.clone().unwrap_or_default();
    tracing::debug!(worker_id, uuid = %uuid, "task starting");
    match run_expression(message.task.as_deref()).await {
        Ok(detail) => {
            tracing::debug!(worker_id, uuid = %uuid, "task finished");
            FinishedEvent {
                worker_id,
                uuid,
                outcome: TaskOutcome::Ok,
                detail,
            }
        }
        Err(reason) => {
            tracing::error!(worker_id, uuid = %uuid, reason = %reason, "task failed");
            FinishedEvent {
                worker_id,
                uuid,
                outcome: TaskOutcome::Error,
                detail: Some(reason),
            }
        }
    }
}

/// The task expression grammar: `sleep <seconds>`, `noop`, `echo <text>`.
async fn run_expression(task: Option<&str>) -> std::result::Result<Option<String>, String> {
    let Some(task) = task else {
        return Err("message has no task expression".to_string());
    };
    let task = task.trim();

    if task == "noop" {
        return Ok(None);
    }
    if let Some(rest) = task.strip_prefix("sleep ") {
        let seconds: f64 = rest
            .trim()
            .parse()
            .map_err(|_| format!("invalid sleep duration `{}`", rest.trim()))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("invalid sleep duration `{seconds}`"));
        }
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
        return Ok(None);
    }
    if let Some(rest) = task.strip_prefix("echo ") {
        return Ok(Some(rest.to_string()));
    }
    Err(format!("unknown task expression `{task}`"))
}

/// The loop run by [`crate::process::InProcessSpawner`] workers.
pub(crate) async fn channel_work_loop(
    worker_id: usize,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Stop => break,
            WorkerCommand::Task { message } => {
                let event = execute(worker_id, &message).await;
                if events.send(WorkerEvent::Finished(event)).is_err() {
                    break;
                }
            }
        }
    }
    tracing::debug!(worker_id, "worker loop drained");
}

/// The subprocess entry point: frames on stdin, events on stdout.
///
/// Invoked by the CLI's hidden `worker` subcommand.  Returns when the parent
/// sends `stop` or closes the pipe.
pub async fn run_worker(worker_id: usize) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::debug!(worker_id, "worker process ready");

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command: WorkerCommand = match serde_json::from_str(&line) {
            Ok(command) => command,
            Err(error) => {
                tracing::error!(worker_id, error = %error, "unparseable frame on worker stdin");
                continue;
            }
        };
        match command {
            WorkerCommand::Stop => break,
            WorkerCommand::Task { message } => {
                let event = execute(worker_id, &message).await;
                let mut frame = serde_json::to_string(&event)?;
                frame.push('\n');
                stdout.write_all(frame.as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }
    tracing::debug!(worker_id, "worker process exiting");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
