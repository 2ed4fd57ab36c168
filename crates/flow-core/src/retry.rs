//! Retry policies and backoff math.
//!
//! The delay schedule is pure so callers can reason about worst-case wait
//! times; jitter is applied at the call site right before sleeping. There
//! is never a delay before the first attempt: `delay_for_attempt(n)` is
//! the wait *after* attempt `n` fails.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Jitter multiplies the computed delay by a uniform factor in this range.
pub const JITTER_MIN: f64 = 0.9;
pub const JITTER_MAX: f64 = 1.1;

/// Shape of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        }
    }
}

/// Backoff configuration: curve, base delay, cap, and jitter toggle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay to sleep after the given failed attempt (1-indexed), without
    /// jitter. Exponential is `base * 2^(attempt-1)`, linear is
    /// `base * attempt`, fixed is `base`; all clamped to `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.kind {
            BackoffKind::Exponential => {
                let factor = 2u64.saturating_pow(attempt - 1);
                self.base_delay_ms.saturating_mul(factor)
            }
            BackoffKind::Linear => self.base_delay_ms.saturating_mul(u64::from(attempt)),
            BackoffKind::Fixed => self.base_delay_ms,
        };
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Delay with jitter applied: the base schedule multiplied by a
    /// uniform factor in `[0.9, 1.1]`, then re-clamped to the cap.
    pub fn jittered_delay(&self, attempt: u32, jitter_factor: f64) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if !self.jitter {
            return base;
        }
        let factor = jitter_factor.clamp(JITTER_MIN, JITTER_MAX);
        let ms = (base.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Total time spent sleeping across `attempts` attempts, jitter
    /// excluded. The first attempt never waits, so this sums the delays
    /// after attempts `1..attempts`.
    pub fn total_retry_delay(&self, attempts: u32) -> Duration {
        (1..attempts).fold(Duration::ZERO, |acc, attempt| {
            acc + self.delay_for_attempt(attempt)
        })
    }
}

/// Full retry policy for a task family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retries).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Case-sensitive substrings matched against error messages.
    pub retryable_errors: Vec<String>,
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::default(),
            retryable_errors: Vec::new(),
            retryable_exit_codes: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Classify a failed attempt. Retryable iff the exit code is listed
    /// or the error message contains any configured substring.
    pub fn is_retryable(&self, exit_code: Option<i32>, error: Option<&str>) -> bool {
        if let Some(code) = exit_code {
            if self.retryable_exit_codes.contains(&code) {
                return true;
            }
        }
        if let Some(message) = error {
            if self
                .retryable_errors
                .iter()
                .any(|needle| message.contains(needle.as_str()))
            {
                return true;
            }
        }
        false
    }

    /// Whether another attempt is allowed after `attempt` attempts ran.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(kind: BackoffKind, base: u64, max: u64) -> BackoffPolicy {
        BackoffPolicy {
            kind,
            base_delay_ms: base,
            max_delay_ms: max,
            jitter: false,
        }
    }

    #[test]
    fn exponential_doubles_and_clamps() {
        let p = policy(BackoffKind::Exponential, 1000, 5000);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(5000));
    }

    #[test]
    fn linear_scales_and_clamps() {
        let p = policy(BackoffKind::Linear, 1000, 3500);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(3500));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(3500));
    }

    #[test]
    fn fixed_is_constant() {
        let p = policy(BackoffKind::Fixed, 750, 10_000);
        for attempt in 1..10 {
            assert_eq!(p.delay_for_attempt(attempt), Duration::from_millis(750));
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let p = BackoffPolicy {
            kind: BackoffKind::Exponential,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            jitter: true,
        };
        // Even at the top of the jitter range, the cap holds.
        for attempt in 1..8 {
            assert!(p.jittered_delay(attempt, JITTER_MAX) <= Duration::from_millis(5000));
            assert!(p.jittered_delay(attempt, JITTER_MIN) <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn jitter_disabled_returns_base_schedule() {
        let p = policy(BackoffKind::Fixed, 1000, 5000);
        assert_eq!(
            p.jittered_delay(1, JITTER_MAX),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn jitter_factor_is_clamped_to_range() {
        let p = BackoffPolicy {
            kind: BackoffKind::Fixed,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            jitter: true,
        };
        // A wild factor is pulled back into [0.9, 1.1].
        assert_eq!(p.jittered_delay(1, 50.0), Duration::from_millis(1100));
        assert_eq!(p.jittered_delay(1, 0.0), Duration::from_millis(900));
    }

    #[test]
    fn total_delay_excludes_first_attempt() {
        let p = policy(BackoffKind::Fixed, 1000, 10_000);
        assert_eq!(p.total_retry_delay(1), Duration::ZERO);
        assert_eq!(p.total_retry_delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn retryable_by_exit_code() {
        let policy = RetryPolicy {
            retryable_exit_codes: vec![75, 111],
            ..RetryPolicy::default()
        };
        assert!(policy.is_retryable(Some(75), None));
        assert!(!policy.is_retryable(Some(1), None));
        assert!(!policy.is_retryable(None, None));
    }

    #[test]
    fn retryable_by_error_substring_case_sensitive() {
        let policy = RetryPolicy {
            retryable_errors: vec!["connection reset".to_string()],
            ..RetryPolicy::default()
        };
        assert!(policy.is_retryable(None, Some("upstream connection reset by peer")));
        assert!(!policy.is_retryable(None, Some("Connection Reset")));
        assert!(!policy.is_retryable(None, Some("disk full")));
    }

    #[test]
    fn attempts_left_respects_max() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.has_attempts_left(1));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));
    }
}
