//! Bounded worker pool shared by backup and restore fan-outs.
//!
//! Every job runs on its own tokio task behind a semaphore permit. A job is
//! time-boxed individually and by the optional operation deadline; on expiry
//! its cancellation token fires, which kills the underlying tool process, and
//! the job is given a short grace period to unwind before it is dropped.

use crate::config::Config;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Extra time beyond the kill grace for a cancelled job to return.
const UNWIND_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Finished(T),
    /// Cancelled by the per-task timeout or the operation deadline.
    TimedOut(String),
    /// Never dispatched because the batch was aborted.
    Skipped,
    /// The task panicked.
    Crashed(String),
}

#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    concurrency: usize,
    task_timeout: Duration,
    operation_timeout: Option<Duration>,
    kill_grace: Duration,
}

impl WorkerPool {
    pub fn new(concurrency: usize, task_timeout: Duration) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            task_timeout,
            operation_timeout: None,
            kill_grace: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pool.concurrency, config.task_timeout())
            .with_operation_timeout(config.operation_timeout())
            .with_kill_grace(config.kill_grace())
    }

    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run every job and wait for all of them to settle.
    ///
    /// Outcomes come back in job order. Cancelling `abort` stops jobs that have
    /// not started yet; jobs already running are left to finish.
    pub async fn run_all<K, T, F, Fut>(
        &self,
        jobs: Vec<(K, F)>,
        abort: &CancellationToken,
    ) -> Vec<(K, TaskOutcome<T>)>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let deadline = self.operation_timeout.map(|timeout| Instant::now() + timeout);
        let mut handles = Vec::with_capacity(jobs.len());

        for (key, job) in jobs {
            let permits = self.permits.clone();
            let abort = abort.clone();
            let task_timeout = self.task_timeout;
            let unwind = self.kill_grace + UNWIND_MARGIN;

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = abort.cancelled() => return TaskOutcome::Skipped,
                    _ = until(deadline) => {
                        return TaskOutcome::TimedOut(
                            "operation deadline expired before the task started".to_string(),
                        )
                    }
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return TaskOutcome::Skipped,
                    },
                };
                if abort.is_cancelled() {
                    return TaskOutcome::Skipped;
                }

                let token = CancellationToken::new();
                let mut work = Box::pin(job(token.clone()));
                let reason = tokio::select! {
                    output = &mut work => {
                        drop(permit);
                        return TaskOutcome::Finished(output);
                    }
                    _ = tokio::time::sleep(task_timeout) => {
                        format!("task exceeded its {:?} timeout", task_timeout)
                    }
                    _ = until(deadline) => "operation deadline expired".to_string(),
                };

                token.cancel();
                if tokio::time::timeout(unwind, &mut work).await.is_err() {
                    warn!("Cancelled task did not unwind within {:?}, dropping it", unwind);
                }
                drop(permit);
                TaskOutcome::TimedOut(reason)
            });
            handles.push((key, handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (key, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("Worker task failed to join: {}", e);
                    TaskOutcome::Crashed(e.to_string())
                }
            };
            outcomes.push((key, outcome));
        }
        outcomes
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
