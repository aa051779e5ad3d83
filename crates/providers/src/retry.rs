use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use courier_core::errors::ErrorClass;

use crate::circuit::CircuitBreaker;
use crate::error::ProviderError;
use crate::limiter::AdaptiveLimiter;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up-to-25% jitter so concurrent slots do not
    /// synchronize their retries.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let multiplier = 1_u64 << exponent;
        let delay_ms = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        let jitter = rand::thread_rng().gen_range(0..=delay_ms / 4);
        Duration::from_millis(delay_ms + jitter)
    }
}

/// Shared call discipline for both adapters: breaker admission, limiter
/// pacing, then the operation; transient failures back off and retry up to
/// the policy bound, everything else surfaces immediately.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    limiter: &AdaptiveLimiter,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt: u32 = 0;
    loop {
        breaker.check()?;
        limiter.acquire().await;

        match op().await {
            Ok(value) => {
                breaker.record_success();
                return Ok(value);
            }
            Err(error) => {
                let transient = error.class() == ErrorClass::Transient;
                if transient {
                    breaker.record_failure();
                }
                if let ProviderError::RateLimited { retry_after } = &error {
                    limiter.record_exhausted(*retry_after);
                }

                if !transient || attempt >= policy.max_retries {
                    return Err(error);
                }

                let delay = policy.backoff(attempt);
                debug!(
                    event_name = "provider.retry.backoff",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient provider failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
