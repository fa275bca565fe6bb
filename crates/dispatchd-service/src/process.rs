//! Worker process supervision.
//!
//! The pool talks to workers through the [`ProcessSpawner`] seam.  The
//! reference spawner launches the current executable with the hidden
//! `worker` subcommand and speaks JSON lines over the child's stdio: task
//! messages down stdin, finished events up stdout, stderr inherited so
//! worker logs land next to service logs.  [`InProcessSpawner`] runs the
//! identical worker loop on a tokio task for tests and embedders.
//!
//! Every spawned worker, regardless of kind, reports its death with a
//! [`WorkerEvent::Exited`] on the shared finished channel.  The pool's
//! drainer uses that to translate a kill into canceled-count bookkeeping
//! and to respawn the slot.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;

use dispatchd_core::{ForkMode, Message};

use crate::error::{Result, ServiceError};
use crate::worker;

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// A directive on a worker's message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Run one task message.
    Task { message: Message },
    /// Finish the current task (none, for a well-behaved pool) and exit.
    Stop,
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Ok,
    Error,
}

/// One entry on the finished queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedEvent {
    pub worker_id: usize,
    pub uuid: String,
    pub outcome: TaskOutcome,
    /// Task output or error text, when there is any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What the supervisor forwards to the pool's drainer.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A task completed (successfully or not) and the worker is free again.
    Finished(FinishedEvent),
    /// The worker process ended.  Sent exactly once per spawned worker.
    Exited { worker_id: usize },
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum HandleKind {
    Subprocess { child: Arc<Mutex<Child>> },
    InProcess { abort: AbortHandle },
}

/// The pool's grip on one worker.
#[derive(Clone)]
pub struct WorkerHandle {
    worker_id: usize,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    kind: HandleKind,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Enqueue a command for the worker.
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ServiceError::WorkerGone {
                worker_id: self.worker_id,
            })
    }

    /// Ask the worker to exit after its current task.  Best effort.
    pub fn stop(&self) {
        let _ = self.commands.send(WorkerCommand::Stop);
    }

    /// Kill the worker.  The supervisor will emit [`WorkerEvent::Exited`].
    pub async fn terminate(&self) {
        match &self.kind {
            HandleKind::Subprocess { child } => {
                let _ = child.lock().await.start_kill();
            }
            HandleKind::InProcess { abort } => abort.abort(),
        }
    }

    /// Wait up to `timeout` for the worker process to exit.
    ///
    /// Returns `true` once the worker is gone.  In-process workers exit as
    /// soon as their loop drains; there is no process to reap.
    pub async fn join(&self, timeout: Duration) -> bool {
        match &self.kind {
            HandleKind::Subprocess { child } => {
                let child = Arc::clone(child);
                tokio::time::timeout(timeout, async move {
                    let _ = child.lock().await.wait().await;
                })
                .await
                .is_ok()
            }
            HandleKind::InProcess { .. } => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Spawners
// ---------------------------------------------------------------------------

/// Creates workers and wires their finished events into the pool.
#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(
        &self,
        worker_id: usize,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle>;
}

/// Spawns the current executable's hidden `worker` subcommand.
pub struct SubprocessSpawner {
    fork_mode: ForkMode,
}

impl SubprocessSpawner {
    #[must_use]
    pub fn new(fork_mode: ForkMode) -> Self {
        Self { fork_mode }
    }
}

#[async_trait]
impl ProcessSpawner for SubprocessSpawner {
    async fn spawn(
        &self,
        worker_id: usize,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle> {
        let spawn_error = |source: std::io::Error| ServiceError::WorkerSpawn { worker_id, source };

        let exe = std::env::current_exe().map_err(spawn_error)?;
        let mut child = Command::new(exe)
            .arg("worker")
            .arg("--worker-id")
            .arg(worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        tracing::info!(
            worker_id,
            pid = child.id(),
            fork_mode = ?self.fork_mode,
            "worker process spawned"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("worker stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error(std::io::Error::other("worker stdout not piped")))?;

        // Pump commands onto the child's stdin as JSON lines.
        let (commands, mut command_rx) = mpsc::unbounded_channel::<WorkerCommand>();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(command) = command_rx.recv().await {
                let mut frame = match serde_json::to_string(&command) {
                    Ok(frame) => frame,
                    Err(error) => {
                        tracing::error!(worker_id, error = %error, "unencodable worker command");
                        continue;
                    }
                };
                frame.push('\n');
                if stdin.write_all(frame.as_bytes()).await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        // Read finished events off stdout; EOF means the process died.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<FinishedEvent>(&line) {
                    Ok(event) => {
                        if events.send(WorkerEvent::Finished(event)).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(worker_id, error = %error, "unparseable frame from worker");
                    }
                }
            }
            let _ = events.send(WorkerEvent::Exited { worker_id });
        });

        Ok(WorkerHandle {
            worker_id,
            commands,
            kind: HandleKind::Subprocess {
                child: Arc::new(Mutex::new(child)),
            },
        })
    }
}

/// Runs the worker loop on a tokio task inside this process.
///
/// Used by the end-to-end tests and by embedders that want the dispatcher
/// without child processes.  The loop body is the same code the subprocess
/// runs, so the dispatch and bookkeeping paths are exercised identically.
#[derive(Default)]
pub struct InProcessSpawner;

#[async_trait]
impl ProcessSpawner for InProcessSpawner {
    async fn spawn(
        &self,
        worker_id: usize,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<WorkerHandle> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let loop_task = tokio::spawn(worker::channel_work_loop(
            worker_id,
            command_rx,
            events.clone(),
        ));
        let abort = loop_task.abort_handle();

        // Watcher: translate loop exit (graceful or aborted) into Exited.
        tokio::spawn(async move {
            let _ = loop_task.await;
            let _ = events.send(WorkerEvent::Exited { worker_id });
        });

        tracing::debug!(worker_id, "in-process worker spawned");
        Ok(WorkerHandle {
            worker_id,
            commands,
            kind: HandleKind::InProcess { abort },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
