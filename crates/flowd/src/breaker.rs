//! Per-key circuit breakers for task families.
//!
//! A breaker trips open after a run of consecutive failures, rejects
//! attempts for a cooldown, then lets one probe through half-open. The
//! probe either closes the breaker or snaps it back open.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Observable snapshot of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct KeyState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Circuit breaker registry keyed by task family.
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Consecutive failures before tripping open.
    threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, KeyState>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an attempt for this key may proceed. An open breaker whose
    /// cooldown has elapsed flips to half-open and admits one probe.
    pub fn allow(&self, key: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = states.entry(key.to_string()).or_insert_with(KeyState::new);

        match entry.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.cooldown {
                    info!(key, "circuit breaker half-open, admitting probe");
                    entry.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful attempt: the breaker closes and the failure
    /// run resets.
    pub fn record_success(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = states.entry(key.to_string()).or_insert_with(KeyState::new);
        entry.state = CircuitState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
    }

    /// Record a failed attempt. A half-open probe failure reopens
    /// immediately; otherwise the breaker opens at the threshold.
    pub fn record_failure(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = states.entry(key.to_string()).or_insert_with(KeyState::new);
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        let should_open = entry.state == CircuitState::HalfOpen
            || entry.consecutive_failures >= self.threshold;
        if should_open && entry.state != CircuitState::Open {
            warn!(
                key,
                failures = entry.consecutive_failures,
                "circuit breaker opened"
            );
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    /// Current state for a key (closed for unknown keys).
    pub fn state(&self, key: &str) -> CircuitState {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states
            .get(key)
            .map_or(CircuitState::Closed, |entry| entry.state)
    }

    /// Snapshot of all tracked breakers.
    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states
            .iter()
            .map(|(key, entry)| BreakerMetrics {
                key: key.clone(),
                state: entry.state,
                consecutive_failures: entry.consecutive_failures,
            })
            .collect()
    }

    /// Force a breaker closed.
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        states.insert(key.to_string(), KeyState::new());
    }
}
