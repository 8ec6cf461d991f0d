use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::error::SourceError;
use crate::sync::rate_limiter::RateLimiter;

/// Throttling is not charged against the retry budget, but a catalog that never stops
/// throttling must still end the call.
const MAX_THROTTLED_ATTEMPTS: u32 = 16;

/// Retry budget for transient catalog errors. Separate from the rate limiter's backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.ceiling)
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = (delay.as_millis() / 4) as u64;
    if max_jitter == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Run one catalog call through the limiter, absorbing throttling and retrying transient
/// failures up to `policy.max_retries` times. `NotFound` and decode errors return at once.
pub async fn call_with_retry<T, F, Fut>(
    limiter: &RateLimiter,
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut retries = 0u32;
    let mut throttled = 0u32;
    loop {
        limiter.acquire().await;
        match call().await {
            Ok(value) => {
                limiter.on_success().await;
                return Ok(value);
            }
            Err(SourceError::Throttled { retry_after }) => {
                limiter.on_throttled(retry_after).await;
                throttled += 1;
                if throttled >= MAX_THROTTLED_ATTEMPTS {
                    warn!(operation, throttled, "catalog kept throttling; giving up");
                    return Err(SourceError::Throttled { retry_after });
                }
            }
            Err(SourceError::Unavailable(msg)) => {
                retries += 1;
                if retries > policy.max_retries {
                    warn!(operation, retries = policy.max_retries, error = %msg, "retry budget exhausted");
                    return Err(SourceError::Unavailable(msg));
                }
                let delay = with_jitter(policy.delay_for(retries));
                warn!(
                    operation,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %msg,
                    "transient catalog error; retrying"
                );
                sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}
