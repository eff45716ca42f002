//! Supervised background tasks
//!
//! Every task owns a stop channel and a single-producer failure channel.
//! A task that returns `Ok` drops its failure sender, which the supervisor
//! sees as a clean exit.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, TorProxyError};

/// What a supervised task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    AnonClient,
    ForwardProxy,
    Application,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AnonClient => "anon-client",
            TaskKind::ForwardProxy => "forward-proxy",
            TaskKind::Application => "application",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure reported by a task
#[derive(Debug, thiserror::Error)]
#[error("{kind} failed: {error}")]
pub struct TaskFailure {
    pub kind: TaskKind,
    #[source]
    pub error: TorProxyError,
}

/// Resolves once `true` is sent or the sender is dropped
pub async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}

/// Asks a task to stop and waits for it
pub struct StopHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl StopHandle {
    /// Signal the task without waiting
    pub fn signal(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Signal the task and wait up to `wait` for it, aborting it afterwards
    pub async fn stop(mut self, wait: Duration) {
        self.signal();
        if tokio::time::timeout(wait, &mut self.join).await.is_err() {
            warn!("Task did not stop within {:?}, aborting", wait);
            self.join.abort();
            let _ = self.join.await;
        }
    }
}

/// A running background unit watched by the supervisor
pub struct SupervisedTask {
    kind: TaskKind,
    stop: StopHandle,
    failures: Option<oneshot::Receiver<TaskFailure>>,
}

impl SupervisedTask {
    /// Spawn `run` with a stop receiver; an `Err` it returns becomes the
    /// task's failure report
    pub fn spawn<F, Fut>(kind: TaskKind, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (failure_tx, failure_rx) = oneshot::channel();
        let fut = run(stop_rx);

        let join = tokio::spawn(async move {
            match fut.await {
                Ok(()) => debug!(task = %kind, "Task finished"),
                Err(error) => {
                    let _ = failure_tx.send(TaskFailure { kind, error });
                }
            }
        });

        Self {
            kind,
            stop: StopHandle { stop_tx, join },
            failures: Some(failure_rx),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Failure receiver; can be taken once
    pub fn take_failures(&mut self) -> Option<oneshot::Receiver<TaskFailure>> {
        self.failures.take()
    }

    /// Stop the task, waiting at most `wait`
    pub async fn stop(self, wait: Duration) {
        debug!(task = %self.kind, "Stopping task");
        self.stop.stop(wait).await;
    }
}
