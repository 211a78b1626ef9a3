use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};

/// Bounded exponential backoff used by the view-invalidation retry loop.
///
/// The bound is deliberately a policy object rather than a constant: callers
/// tune attempts, delays and an optional wall-clock budget per deployment.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
    time_budget: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(8, Duration::from_millis(20)).with_jitter(0.2)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(5),
            jitter_fraction: 0.0,
            time_budget: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        if !max_delay.is_zero() {
            self.max_delay = max_delay;
        }
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget.filter(|duration| !duration.is_zero());
        self
    }

    pub fn handle(&self) -> RetryHandle {
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
            deadline: self
                .time_budget
                .and_then(|budget| Instant::now().checked_add(budget)),
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let scaled = self
            .base_delay
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        let bounded = scaled.min(self.max_delay);
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let factor = thread_rng().gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        let millis = (bounded.as_millis() as f64 * factor).round().max(0.0);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }
}

pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// attempt or time budget is spent. The first retry goes immediately.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        let delay = if self.attempts == 1 {
            Duration::ZERO
        } else {
            self.policy.delay_for_attempt(self.attempts)
        };
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline || now + delay > deadline {
                return None;
            }
        }
        Some(delay)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}
