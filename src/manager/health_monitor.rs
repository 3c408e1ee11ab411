//! Pure health monitoring and reconnection logic
//!
//! This module contains the decisions the connection actor makes about retrying
//! and about heartbeat liveness, kept free of I/O so they can be tested directly.

use super::connection::{ConnectionState, ReconnectPolicy};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine whether another reconnect attempt should be scheduled
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &ReconnectPolicy,
        intentional_disconnect: bool,
    ) -> ReconnectionDecision {
        if intentional_disconnect {
            return ReconnectionDecision::AbortIntentionalDisconnect;
        }

        if current_attempts >= policy.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.calculate_backoff_delay(attempt),
        }
    }

    /// A heartbeat window is missed once the last pong is older than two intervals
    pub fn heartbeat_expired(last_pong_age: Duration, interval: Duration) -> bool {
        last_pong_age > interval.saturating_mul(2)
    }

    /// Round-trip latency from the echoed ping timestamp, if the pong carried one
    pub fn pong_latency_ms(echoed_timestamp_ms: Option<i64>, now_ms: i64) -> Option<i64> {
        echoed_timestamp_ms.map(|sent| now_ms.saturating_sub(sent).max(0))
    }

    /// Check if connection state allows writing to the transport
    pub fn can_send(state: ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Whether a connect request should be treated as a no-op
    pub fn connect_is_noop(state: ConnectionState) -> bool {
        matches!(
            state,
            ConnectionState::Connected | ConnectionState::Connecting
        )
    }

    /// Log connection state transition
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                warn!("Connection lost");
            }
            (ConnectionState::Disconnected, ConnectionState::Reconnecting) => {
                info!("Reconnect scheduled");
            }
            (ConnectionState::Connecting, ConnectionState::Disconnected) => {
                error!("Connection attempt failed");
            }
            _ => {
                info!("Connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Schedule attempt number `attempt` after `delay`
    Proceed { attempt: u32, delay: Duration },
    /// Caller asked to disconnect
    AbortIntentionalDisconnect,
    /// Attempt budget exhausted
    AbortMaxAttemptsExceeded,
}

impl ReconnectionDecision {
    /// Human-readable reason for aborting, `None` when proceeding
    pub fn abort_reason(&self) -> Option<&'static str> {
        match self {
            ReconnectionDecision::Proceed { .. } => None,
            ReconnectionDecision::AbortIntentionalDisconnect => Some("intentional disconnect"),
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                Some("maximum reconnect attempts reached")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let decision = HealthMonitor::should_attempt_reconnection(0, &policy(10), false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );

        let decision = HealthMonitor::should_attempt_reconnection(5, &policy(10), false);
        assert_eq!(
            decision,
            ReconnectionDecision::Proceed {
                attempt: 6,
                delay: Duration::from_millis(30_000)
            }
        );
    }

    #[test]
    fn test_intentional_disconnect_aborts() {
        let decision = HealthMonitor::should_attempt_reconnection(0, &policy(10), true);
        assert_eq!(decision, ReconnectionDecision::AbortIntentionalDisconnect);
        assert_eq!(decision.abort_reason(), Some("intentional disconnect"));
    }

    #[test]
    fn test_max_attempts_aborts() {
        let decision = HealthMonitor::should_attempt_reconnection(2, &policy(2), false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);

        let decision = HealthMonitor::should_attempt_reconnection(0, &policy(0), false);
        assert_eq!(decision, ReconnectionDecision::AbortMaxAttemptsExceeded);
    }

    #[test]
    fn test_heartbeat_expired() {
        let interval = Duration::from_secs(30);
        assert!(!HealthMonitor::heartbeat_expired(
            Duration::from_secs(30),
            interval
        ));
        assert!(!HealthMonitor::heartbeat_expired(
            Duration::from_secs(60),
            interval
        ));
        assert!(HealthMonitor::heartbeat_expired(
            Duration::from_millis(60_001),
            interval
        ));
    }

    #[test]
    fn test_pong_latency() {
        assert_eq!(HealthMonitor::pong_latency_ms(Some(1_000), 1_250), Some(250));
        assert_eq!(HealthMonitor::pong_latency_ms(None, 1_250), None);
        // Clock skew never yields negative latency
        assert_eq!(HealthMonitor::pong_latency_ms(Some(2_000), 1_000), Some(0));
    }

    #[test]
    fn test_can_send() {
        assert!(HealthMonitor::can_send(ConnectionState::Connected));
        assert!(!HealthMonitor::can_send(ConnectionState::Connecting));
        assert!(!HealthMonitor::can_send(ConnectionState::Reconnecting));
        assert!(!HealthMonitor::can_send(ConnectionState::Disconnected));
    }

    #[test]
    fn test_connect_is_noop() {
        assert!(HealthMonitor::connect_is_noop(ConnectionState::Connected));
        assert!(HealthMonitor::connect_is_noop(ConnectionState::Connecting));
        assert!(!HealthMonitor::connect_is_noop(ConnectionState::Reconnecting));
        assert!(!HealthMonitor::connect_is_noop(ConnectionState::Disconnected));
    }
}
