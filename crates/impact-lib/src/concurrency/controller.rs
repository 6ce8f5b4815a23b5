//! Bounded-parallelism runner with retry and exponential backoff

use crate::config::ConcurrencyConfig;
use crate::error::{ImpactError, Result};
use crate::observability::EngineMetrics;
use futures::future::join_all;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Runs idempotent fetches against one rate-limited upstream
///
/// Clones share the same semaphore, so every node handed a clone counts
/// against one concurrency ceiling. A task holds its permit from its first
/// attempt until it settles, backoff included.
#[derive(Clone)]
pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    config: ConcurrencyConfig,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("max_concurrency", &self.config.max_concurrency)
            .field("available_permits", &self.semaphore.available_permits())
            .finish()
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            config,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Permits currently free
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run one task to completion under the shared ceiling
    ///
    /// Transient failures (including per-attempt timeouts) are retried up
    /// to `max_retries` times; permanent failures return immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, task: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ImpactError::PermanentConfig("concurrency limiter closed".to_string()))?;

        let timeout = self.config.attempt_timeout();
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(timeout, task()).await {
                Ok(result) => result,
                Err(_) => Err(ImpactError::Timeout(timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(task = %label, attempt, "task succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                self.metrics.inc_fetch_failures();
                warn!(
                    event = "retries_exhausted",
                    task = %label,
                    attempts = attempt,
                    error = %err,
                    "giving up on task"
                );
                return Err(ImpactError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.config.backoff(attempt);
            self.metrics.inc_fetch_retries();
            warn!(
                event = "retry_scheduled",
                task = %label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Launch every task together and wait for all of them to settle
    ///
    /// Results come back in input order; one task's failure never hides
    /// another's result.
    pub async fn run_bounded<K, T, F, Fut>(&self, tasks: Vec<(K, F)>) -> Vec<(K, Result<T>)>
    where
        K: Display,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let runs = tasks.into_iter().map(|(key, task)| async move {
            let label = key.to_string();
            let result = self.run(&label, task).await;
            (key, result)
        });

        join_all(runs).await
    }
}
