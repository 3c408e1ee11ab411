//! Pure connection state and reconnect policy
//!
//! This module contains the connection state type and the backoff arithmetic used
//! by the reconnection scheduler.

use crate::config::ConnectionSection;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection state; exactly one is active at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport and no attempt in flight
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// Transport is open
    Connected,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        };
        f.write_str(name)
    }
}

/// Reconnection policy with bounded exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts allowed before giving up
    pub max_attempts: u32,
    /// Delay before attempt 1
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ConnectionSection::default())
    }
}

impl From<&ConnectionSection> for ReconnectPolicy {
    fn from(section: &ConnectionSection) -> Self {
        Self {
            max_attempts: section.max_reconnect_attempts,
            base_delay: section.base_reconnect_delay(),
            max_delay: section.max_reconnect_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a 1-based attempt: `min(base * 2^(attempt-1), max)`, no jitter
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let delay_ms = base_ms
            .checked_mul(1u64 << exponent)
            .unwrap_or(u64::MAX)
            .min(max_ms);
        Duration::from_millis(delay_ms)
    }

    /// Sum of every backoff delay before the scheduler gives up
    pub fn calculate_max_total_time(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .sum()
    }
}
