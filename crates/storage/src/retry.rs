//! Exponential backoff for blocking operations

use shard_core::{Result, RetryConfig};
use tracing::warn;

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. The last error is returned.
pub fn with_retry<T, F>(retry: &RetryConfig, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                attempt += 1;
                warn!(
                    %operation,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after transient error"
                );
                std::thread::sleep(delay);
            }
            Err(e) => return Err(e),
        }
    }
}
