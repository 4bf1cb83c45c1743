//! Bounded local retry of switch operations
//!
//! Only RETRY is reissued. PROTOCOL_ERROR and FATAL come back on the first
//! occurrence, as does RESOURCE_UNAVAILABLE, which the caller re-drives later.

use crate::config::RetryConfig;
use crate::metrics::{record_switch_call, InvocationStats};
use crate::switch::{SwitchOperation, SwitchStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

type StatsKey = (String, SwitchOperation);

/// Invokes switch operations with retry and records per-operation statistics
#[derive(Debug, Clone)]
pub struct SwitchInvoker {
    retry: RetryConfig,
    stats: Arc<Mutex<HashMap<StatsKey, InvocationStats>>>,
}

impl SwitchInvoker {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Call `call` until it answers something other than RETRY or attempts run out.
    ///
    /// An exhausted retry comes back as `Err(SwitchStatus::Retry)`.
    pub async fn invoke<T, F, Fut>(
        &self,
        resource: &str,
        operation: SwitchOperation,
        mut call: F,
    ) -> Result<T, SwitchStatus>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SwitchStatus>>,
    {
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let result = call().await;
            let elapsed = started.elapsed();
            let status = match &result {
                Ok(_) => SwitchStatus::Ok,
                Err(status) => *status,
            };
            record_switch_call(resource, operation, status, elapsed);

            let retrying = status == SwitchStatus::Retry && attempt < self.retry.max_attempts;
            self.record(resource, operation, elapsed, status, retrying);

            if !retrying {
                if status == SwitchStatus::Retry {
                    warn!(
                        "{} on {} still answering RETRY after {} attempts",
                        operation, resource, attempt
                    );
                }
                return result;
            }

            let backoff = self.retry.backoff(attempt);
            debug!(
                "Retrying {} on {} (attempt {}) in {:?}",
                operation,
                resource,
                attempt + 1,
                backoff
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    fn record(
        &self,
        resource: &str,
        operation: SwitchOperation,
        elapsed: std::time::Duration,
        status: SwitchStatus,
        retrying: bool,
    ) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats
            .entry((resource.to_string(), operation))
            .or_default();
        entry.record_call(elapsed);
        if retrying {
            entry.retries += 1;
        } else if !status.is_ok() {
            entry.failures += 1;
        }
    }

    /// Statistics for one operation of one resource manager
    pub fn stats_for(&self, resource: &str, operation: SwitchOperation) -> InvocationStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(resource.to_string(), operation))
            .cloned()
            .unwrap_or_default()
    }

    /// All statistics, sorted by resource then operation
    pub fn stats(&self) -> Vec<(String, SwitchOperation, InvocationStats)> {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = stats
            .iter()
            .map(|((resource, operation), stats)| (resource.clone(), *operation, stats.clone()))
            .collect();
        all.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let invoker = SwitchInvoker::new(fast_retry(3));
        let calls = AtomicU32::new(0);

        let result = invoker
            .invoke("DB1", SwitchOperation::Commit, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(SwitchStatus::Retry)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(1));
        let stats = invoker.stats_for("DB1", SwitchOperation::Commit);
        assert_eq!(stats.invoked, 2);
        assert_eq!(stats.retries, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let invoker = SwitchInvoker::new(fast_retry(3));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = invoker
            .invoke("DB1", SwitchOperation::Prepare, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SwitchStatus::Retry) }
            })
            .await;

        assert_eq!(result, Err(SwitchStatus::Retry));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(invoker.stats_for("DB1", SwitchOperation::Prepare).failures, 1);
    }

    #[tokio::test]
    async fn test_hard_failures_are_not_retried() {
        let invoker = SwitchInvoker::new(fast_retry(5));
        for status in [
            SwitchStatus::Fatal,
            SwitchStatus::ProtocolError,
            SwitchStatus::ResourceUnavailable,
        ] {
            let calls = AtomicU32::new(0);
            let result: Result<(), _> = invoker
                .invoke("DB1", SwitchOperation::End, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(status) }
                })
                .await;
            assert_eq!(result, Err(status));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
        assert_eq!(invoker.stats().len(), 1);
    }
}
