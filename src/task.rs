//! Periodic task scheduling.
//!
//! Each registered task gets its own worker loop, so successive invocations
//! of the same task never overlap while distinct tasks run concurrently.
//! Invocations and failures are counted per task name in the metrics
//! registry.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::metrics;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Runs named callables at fixed intervals until shutdown.
pub struct TaskManager {
    shutdown: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl TaskManager {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            workers: Vec::new(),
        }
    }

    /// Register a periodic task. The first invocation happens immediately,
    /// then every `interval`. Iterations of one task are strictly serialized;
    /// an iteration in flight when shutdown fires is dropped at its next
    /// await point.
    pub fn register<F>(&mut self, name: &str, interval: Duration, task: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let token = self.shutdown.clone();
        let task_name = name.to_string();

        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                metrics::registry().inc_task(metrics::TASK_INVOCATIONS, &task_name);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    result = task() => {
                        if let Err(e) = result {
                            metrics::registry().inc_task(metrics::TASK_ERRORS, &task_name);
                            tracing::warn!(task = %task_name, error = %e, "Task iteration failed");
                        }
                    }
                }
            }
            tracing::debug!(task = %task_name, "Task worker stopped");
        });

        self.workers.push((name.to_string(), worker));
    }

    /// Cancel every task and wait up to `timeout` for the workers to exit.
    /// Returns true when all exited in time; workers that did not are
    /// abandoned and reported.
    pub async fn stop_all(self, timeout: Duration) -> bool {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + timeout;
        let mut all_exited = true;

        for (name, worker) in self.workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(task = %name, error = %e, "Task worker panicked");
                }
                Err(_) => {
                    all_exited = false;
                    tracing::warn!(task = %name, "Task did not stop within timeout, abandoning");
                }
            }
        }

        all_exited
    }
}
