//! Reconnection backoff for the chat socket.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between reconnection attempts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect automatically.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Default::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based), or `None` once the
    /// policy has given up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Some(Duration::from_millis(millis as u64))
    }
}

/// Tracks consecutive failures against a policy.
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    /// Register a failure and return the wait before the next attempt.
    pub fn next_delay(&mut self, policy: &ReconnectPolicy) -> Option<(u32, Duration)> {
        self.attempt = self.attempt.saturating_add(1);
        policy.delay_for(self.attempt).map(|d| (self.attempt, d))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
