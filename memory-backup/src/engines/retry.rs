//! Bounded exponential backoff for transient engine faults.

use super::Engine;
use crate::config::RetryConfig;
use crate::utils::errors::EngineError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient kind, runs out of
    /// attempts, or `cancel` fires. The last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        engine: Engine,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let attempts = self.attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.kind.is_transient() || attempt >= attempts || cancel.is_cancelled() {
                return Err(err);
            }

            warn!(
                engine = %engine,
                attempt,
                error = %err,
                "Transient failure, retrying in {}ms",
                backoff.as_millis()
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(err),
            }

            backoff = (backoff * 2).min(self.max_backoff);
            attempt += 1;
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
