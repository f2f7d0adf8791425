//! Retrying provider calls.

use std::future::Future;

use hostprov_reconcile::RetryPolicy;
use tracing::warn;

use super::ProviderError;

/// Run `call`, retrying transient failures with capped backoff.
///
/// Fatal and not-found errors are returned on the first occurrence; a
/// transient error is returned once `policy.max_attempts` calls have failed.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                let delay = policy.backoff(attempt);
                warn!(
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err.message,
                    "Transient provider error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
