//! Retry with exponential backoff for backend calls.

use std::future::Future;

use mesh_core::RetryConfig;
use metrics::counter;
use tracing::{debug, warn};

use crate::backend::BackendOp;
use crate::error::BackendError;

/// Runs `call` until it succeeds, fails with a non-transient error, or the
/// attempt budget in `policy` is spent.
///
/// The returned error is the last one observed.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryConfig,
    op: BackendOp,
    bucket: &str,
    mut call: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        bucket = %bucket,
                        operation = op.as_str(),
                        attempt = attempt,
                        "Backend call succeeded on retry"
                    );
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let backoff = policy.backoff_for_attempt(attempt);
                counter!("mesh_backend_retries_total", "operation" => op.as_str()).increment(1);
                warn!(
                    bucket = %bucket,
                    operation = op.as_str(),
                    attempt = attempt,
                    max_attempts = max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient backend error, retrying after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(
                        bucket = %bucket,
                        operation = op.as_str(),
                        attempts = attempt,
                        error = %e,
                        "Retry budget exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}
