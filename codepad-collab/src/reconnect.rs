//! Reconnect policy: decides whether and when to retry after an unplanned
//! closure.
//!
//! Delay for retry `n` (1-based):
//! ```text
//! base(n)  = min(initial_delay · multiplierⁿ⁻¹, max_delay)
//! delay(n) = base(n) · (1 ± jitter)          clamped to max_delay
//! ```
//! Retrying stops once `max_attempts` or `max_elapsed` is exceeded; the
//! connection manager then reports the session as offline.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive retries (1.0 = fixed delay).
    pub multiplier: f64,
    /// Symmetric jitter ratio in `[0, 1]`.
    pub jitter: f64,
    /// Give up after this many consecutive failed retries (None = never).
    pub max_attempts: Option<u32>,
    /// Give up once this much time has passed since the first failure.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(12),
            max_elapsed_ms: None,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay, unbounded attempts.
    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter: 0.0,
            max_attempts: None,
            max_elapsed_ms: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed_ms = max_elapsed.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }

    /// Check the policy for values that would make the schedule meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(format!("jitter must be within [0, 1], got {}", self.jitter));
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".into());
        }
        Ok(())
    }

    /// Delay for retry `attempt` given a jitter sample in `[0, 1)`.
    ///
    /// A sample of 0.5 yields the un-jittered delay.
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let max = self.max_delay().as_secs_f64();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (self.initial_delay().as_secs_f64() * self.multiplier.powi(exponent)).min(max);

        let factor = 1.0 + self.jitter * (2.0 * jitter_sample.clamp(0.0, 1.0) - 1.0);
        Duration::from_secs_f64((base * factor).clamp(0.0, max))
    }

    /// Delay for retry `attempt`, or `None` once the policy gives up.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        if let Some(max_ms) = self.max_elapsed_ms {
            if elapsed >= Duration::from_millis(max_ms) {
                return None;
            }
        }

        let sample = if self.jitter > 0.0 {
            rand::thread_rng().gen::<f64>()
        } else {
            0.5
        };
        Some(self.delay_for(attempt, sample))
    }
}

/// Retry bookkeeping for one session.
///
/// Counts consecutive failures since the last successful open and remembers
/// when the failure streak began.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    failing_since: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            failing_since: None,
        }
    }

    /// Record a failure and compute the next retry.
    ///
    /// Returns `(attempt, delay)` or `None` when the policy gives up.
    pub fn next(&mut self) -> Option<(u32, Duration)> {
        let now = Instant::now();
        let since = *self.failing_since.get_or_insert(now);
        self.attempts = self.attempts.saturating_add(1);

        self.policy
            .next_delay(self.attempts, now - since)
            .map(|delay| (self.attempts, delay))
    }

    /// Forget the failure streak (after a successful open or a new session).
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.failing_since = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
