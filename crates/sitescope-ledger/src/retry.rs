//! Retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Run `op` up to `max_attempts` times, sleeping `base_delay * 2^(n-1)` after
/// the n-th failure. Errors for which `should_retry` returns `false` are
/// returned immediately.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    mut op: F,
    max_attempts: u32,
    base_delay: Duration,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && should_retry(&e) => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
                warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    "Operation failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    error!(attempt, error = %e, "Operation failed after retries");
                }
                return Err(e);
            }
        }
    }
}
