//! Graceful shutdown.
//!
//! Cleanup work is registered as named async tasks and executed in order,
//! each bounded by its own deadline; a task that overruns or fails is
//! logged and skipped so the rest of the chain still runs. The whole chain
//! sits under a hard cap enforced by the caller.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use std::time::Instant;

use tracing::info;
use tracing::warn;

use crate::error::GatewayError;

pub const DEFAULT_TASK_DEADLINE: Duration = Duration::from_secs(10);
pub const SHUTDOWN_HARD_CAP: Duration = Duration::from_secs(30);

type CleanupFuture = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

struct CleanupTask {
    name: String,
    future: CleanupFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupSummary {
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct CleanupRegistry {
    tasks: Vec<CleanupTask>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.tasks.push(CleanupTask {
            name: name.into(),
            future: Box::pin(future),
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task in registration order with a per-task deadline.
    pub async fn run(self, task_deadline: Duration) -> CleanupSummary {
        let started = Instant::now();
        let mut summary = CleanupSummary {
            completed: 0,
            failed: 0,
        };

        for task in self.tasks {
            info!("running cleanup: {}", task.name);
            match tokio::time::timeout(task_deadline, task.future).await {
                Ok(Ok(())) => {
                    summary.completed += 1;
                }
                Ok(Err(err)) => {
                    warn!("cleanup '{}' failed: {err}", task.name);
                    summary.failed += 1;
                }
                Err(_) => {
                    warn!(
                        "cleanup '{}' exceeded its {task_deadline:?} deadline; skipping",
                        task.name
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            "shutdown chain finished: {} completed, {} failed in {:?}",
            summary.completed,
            summary.failed,
            started.elapsed()
        );
        summary
    }
}

/// Resolve when the process receives SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("cannot install SIGINT handler: {err}");
                return std::future::pending::<()>().await;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("cannot install SIGTERM handler: {err}");
                return std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C, shutting down");
    }
}
