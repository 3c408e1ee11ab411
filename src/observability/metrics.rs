//! Connection metrics
//!
//! Counters are owned by the connection actor and mutated only there; handles read
//! the published copy and derive live uptime from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic counters and timestamps for one connection manager
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    total_connections: u64,
    total_disconnections: u64,
    total_reconnect_attempts: u64,
    total_messages_sent: u64,
    total_messages_received: u64,
    total_errors: u64,
    last_connected_at: Option<DateTime<Utc>>,
    last_disconnected_at: Option<DateTime<Utc>>,
    accumulated_uptime: Duration,
    connected_since: Option<Instant>,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&mut self) {
        self.total_connections += 1;
        self.last_connected_at = Some(Utc::now());
        self.connected_since = Some(Instant::now());
    }

    /// Record a closed connection and fold its lifetime into accumulated uptime
    pub fn connection_closed(&mut self) {
        self.total_disconnections += 1;
        self.last_disconnected_at = Some(Utc::now());
        if let Some(since) = self.connected_since.take() {
            self.accumulated_uptime += since.elapsed();
        }
    }

    pub fn reconnect_attempted(&mut self) {
        self.total_reconnect_attempts += 1;
    }

    pub fn message_sent(&mut self) {
        self.total_messages_sent += 1;
    }

    pub fn message_received(&mut self) {
        self.total_messages_received += 1;
    }

    pub fn error_recorded(&mut self) {
        self.total_errors += 1;
    }

    /// Zero every counter; an open connection keeps counting uptime from now
    pub fn reset(&mut self) {
        let still_connected = self.connected_since.is_some();
        *self = Self::default();
        if still_connected {
            self.connected_since = Some(Instant::now());
        }
    }

    /// Point-in-time copy with uptime including the current connection
    pub fn snapshot(&self, now: Instant) -> MetricsSnapshot {
        let current = self
            .connected_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        let total = self.accumulated_uptime + current;

        MetricsSnapshot {
            total_connections: self.total_connections,
            total_disconnections: self.total_disconnections,
            total_reconnect_attempts: self.total_reconnect_attempts,
            total_messages_sent: self.total_messages_sent,
            total_messages_received: self.total_messages_received,
            total_errors: self.total_errors,
            last_connected_at: self.last_connected_at,
            last_disconnected_at: self.last_disconnected_at,
            current_uptime_ms: duration_ms(current),
            total_uptime_ms: duration_ms(total),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serializable metrics view returned by status queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub total_disconnections: u64,
    pub total_reconnect_attempts: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_errors: u64,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    /// Uptime of the open connection, 0 when disconnected
    pub current_uptime_ms: u64,
    /// Uptime summed across every connection
    pub total_uptime_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_snapshot() {
        let metrics = ConnectionMetrics::new();
        let snapshot = metrics.snapshot(Instant::now());
        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.total_errors, 0);
        assert_eq!(snapshot.last_connected_at, None);
        assert_eq!(snapshot.current_uptime_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uptime_accumulates_across_connections() {
        let mut metrics = ConnectionMetrics::new();

        metrics.connection_opened();
        tokio::time::advance(Duration::from_secs(5)).await;
        let live = metrics.snapshot(Instant::now());
        assert_eq!(live.current_uptime_ms, 5_000);
        assert_eq!(live.total_uptime_ms, 5_000);

        metrics.connection_closed();
        tokio::time::advance(Duration::from_secs(10)).await;
        metrics.connection_opened();
        tokio::time::advance(Duration::from_secs(2)).await;

        let snapshot = metrics.snapshot(Instant::now());
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.total_disconnections, 1);
        assert_eq!(snapshot.current_uptime_ms, 2_000);
        assert_eq!(snapshot.total_uptime_ms, 7_000);
        assert!(snapshot.last_disconnected_at.is_some());
    }

    #[test]
    fn test_counters() {
        let mut metrics = ConnectionMetrics::new();
        metrics.message_sent();
        metrics.message_sent();
        metrics.message_received();
        metrics.error_recorded();
        metrics.reconnect_attempted();

        let snapshot = metrics.snapshot(Instant::now());
        assert_eq!(snapshot.total_messages_sent, 2);
        assert_eq!(snapshot.total_messages_received, 1);
        assert_eq!(snapshot.total_errors, 1);
        assert_eq!(snapshot.total_reconnect_attempts, 1);
    }

    #[test]
    fn test_reset_zeroes_counters() {
        let mut metrics = ConnectionMetrics::new();
        metrics.connection_opened();
        metrics.message_sent();
        metrics.reset();

        let snapshot = metrics.snapshot(Instant::now());
        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.total_messages_sent, 0);
        assert_eq!(snapshot.last_connected_at, None);
    }
}
