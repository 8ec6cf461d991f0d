use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Smallest penalty applied on the first throttling signal when no base rate is configured.
const MIN_PENALTY: Duration = Duration::from_millis(250);

#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitSettings {
    /// Steady-state rate. `0` disables pacing (throttle penalties still apply).
    pub requests_per_second: f64,
    /// Upper bound on the extra delay added by throttling signals.
    pub backoff_ceiling: Duration,
    /// Consecutive successes after which the extra delay is dropped.
    pub reset_after_successes: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 2.0,
            backoff_ceiling: Duration::from_secs(120),
            reset_after_successes: 5,
        }
    }
}

impl RateLimitSettings {
    /// Spacing implied by the steady-state rate, never longer than `backoff_ceiling`.
    pub fn per_request_interval(&self) -> Option<Duration> {
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return None;
        }
        let ceiling = self.backoff_ceiling;
        Some(
            Duration::try_from_secs_f64(1.0 / self.requests_per_second)
                .map_or(ceiling, |interval| interval.min(ceiling)),
        )
    }
}

#[derive(Debug)]
struct ThrottleState {
    next_allowed: Instant,
    penalty: Duration,
    success_streak: u32,
}

/// Paces calls to one catalog. Cloning shares the underlying state, so every component in
/// a run sees the same backoff.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Arc<Mutex<ThrottleState>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            state: Arc::new(Mutex::new(ThrottleState {
                next_allowed: Instant::now(),
                penalty: Duration::ZERO,
                success_streak: 0,
            })),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    fn base_interval(&self) -> Duration {
        self.settings.per_request_interval().unwrap_or(Duration::ZERO)
    }

    /// Wait until the next call is permitted and reserve the slot after it.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let wait_until = if now >= state.next_allowed {
            now
        } else {
            state.next_allowed
        };
        let sleep_duration = wait_until.saturating_duration_since(now);
        state.next_allowed = wait_until + self.base_interval() + state.penalty;
        drop(state);

        if !sleep_duration.is_zero() {
            sleep(sleep_duration).await;
        }
    }

    /// The catalog pushed back. Doubles the penalty up to the ceiling and, with a hint,
    /// holds the next `acquire` for at least that long.
    pub async fn on_throttled(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().await;
        let ceiling = self.settings.backoff_ceiling;
        let escalated = if state.penalty.is_zero() {
            self.base_interval().max(MIN_PENALTY)
        } else {
            state.penalty.saturating_mul(2)
        };
        state.penalty = escalated.min(ceiling);
        state.success_streak = 0;

        let now = Instant::now();
        let hold = retry_after.unwrap_or(Duration::ZERO).max(state.penalty);
        if state.next_allowed < now + hold {
            state.next_allowed = now + hold;
        }
        warn!(
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            penalty_ms = state.penalty.as_millis() as u64,
            "rate limiter: throttled by catalog"
        );
    }

    pub async fn on_success(&self) {
        let mut state = self.state.lock().await;
        if state.penalty.is_zero() {
            return;
        }
        state.success_streak += 1;
        debug!(streak = state.success_streak, "rate limiter: success under backoff");
        if state.success_streak >= self.settings.reset_after_successes {
            state.penalty = Duration::ZERO;
            state.success_streak = 0;
            info!("rate limiter: back to baseline rate");
        }
    }

    /// Current spacing between permitted calls.
    pub async fn current_delay(&self) -> Duration {
        let state = self.state.lock().await;
        self.base_interval() + state.penalty
    }
}

#[cfg(test)]
mod tests {
    use super::{RateLimitSettings, RateLimiter};
    use tokio::time::{Duration, Instant};

    fn settings(rps: f64) -> RateLimitSettings {
        RateLimitSettings {
            requests_per_second: rps,
            backoff_ceiling: Duration::from_secs(60),
            reset_after_successes: 3,
        }
    }

    #[tokio::test]
    async fn throttle_sleeps_between_requests() {
        tokio::time::pause();
        let settings = settings(10.0);
        let delay = settings.per_request_interval().unwrap();
        let limiter = RateLimiter::new(settings);

        // First call should be immediate.
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= delay,
            "expected wait of at least {:?}, but got {:?}",
            delay,
            elapsed
        );
    }

    #[tokio::test]
    async fn retry_after_hint_holds_next_acquire() {
        tokio::time::pause();
        let limiter = RateLimiter::new(settings(10.0));
        limiter.acquire().await;

        limiter.on_throttled(Some(Duration::from_secs(5))).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn backoff_escalates_to_ceiling_and_resets_after_successes() {
        tokio::time::pause();
        let mut cfg = settings(10.0);
        cfg.backoff_ceiling = Duration::from_millis(900);
        let limiter = RateLimiter::new(cfg);
        let baseline = limiter.current_delay().await;
        assert_eq!(baseline, Duration::from_millis(100));

        limiter.on_throttled(None).await;
        let first = limiter.current_delay().await;
        limiter.on_throttled(None).await;
        let second = limiter.current_delay().await;
        assert!(second > first);

        for _ in 0..5 {
            limiter.on_throttled(None).await;
        }
        assert_eq!(
            limiter.current_delay().await,
            baseline + Duration::from_millis(900)
        );

        limiter.on_success().await;
        limiter.on_success().await;
        assert!(limiter.current_delay().await > baseline);
        limiter.on_success().await;
        assert_eq!(limiter.current_delay().await, baseline);
    }

    #[tokio::test]
    async fn throttling_interrupts_success_streak() {
        tokio::time::pause();
        let limiter = RateLimiter::new(settings(10.0));
        limiter.on_throttled(None).await;
        limiter.on_success().await;
        limiter.on_success().await;
        limiter.on_throttled(None).await;
        limiter.on_success().await;
        limiter.on_success().await;
        assert!(limiter.current_delay().await > Duration::from_millis(100));
    }

    #[test]
    fn vanishing_rate_is_capped_at_the_ceiling() {
        assert_eq!(
            settings(1e-30).per_request_interval(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(
            settings(0.001).per_request_interval(),
            Some(Duration::from_secs(60))
        );
        assert_eq!(settings(f64::NAN).per_request_interval(), None);
    }

    #[tokio::test]
    async fn tiny_rate_paces_at_the_ceiling() {
        tokio::time::pause();
        let limiter = RateLimiter::new(settings(1e-30));
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn zero_rate_disables_pacing() {
        tokio::time::pause();
        let limiter = RateLimiter::new(settings(0.0));
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
