//! Test helpers and utilities for integration tests

use resilink::config::{CircuitBreakerSection, ConnectionSection};
use resilink::events::{EventKind, ManagerEvent};
use resilink::testing::MockConnector;
use resilink::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

pub const TEST_ENDPOINT: &str = "wss://stream.example.com/feed";

/// Short delays, no heartbeat and a breaker that stays out of the way
#[allow(dead_code)]
pub fn test_config() -> ConnectionSection {
    ConnectionSection {
        max_reconnect_attempts: 3,
        base_reconnect_delay_ms: 100,
        max_reconnect_delay_ms: 1_000,
        heartbeat_interval_ms: 0,
        connection_timeout_ms: 1_000,
        max_queue_size: 100,
        event_buffer: 256,
        circuit_breaker: CircuitBreakerSection {
            failure_threshold: 100,
            recovery_timeout_ms: 60_000,
            monitoring_period_ms: 10_000,
        },
    }
}

/// Build a manager over `connector` and subscribe before anything happens
#[allow(dead_code)]
pub fn start_manager(
    connector: &Arc<MockConnector>,
    config: ConnectionSection,
) -> (ConnectionManager, broadcast::Receiver<ManagerEvent>) {
    let manager = ConnectionManager::with_connector(TEST_ENDPOINT, config, connector.clone())
        .expect("test configuration is valid");
    let events = manager.subscribe();
    (manager, events)
}

/// Receive events until one named `name` arrives
///
/// Paused test time auto-advances while the actor waits on timers, so the timeout
/// only trips when the event can never happen.
#[allow(dead_code)]
pub async fn wait_for(events: &mut broadcast::Receiver<ManagerEvent>, name: &str) -> ManagerEvent {
    let deadline = Duration::from_secs(24 * 60 * 60);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if event.kind.name() == name => return event,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => panic!("test subscriber lagged by {skipped}"),
                Err(RecvError::Closed) => panic!("event channel closed waiting for {name}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Let the actor run every ready handler without advancing time
#[allow(dead_code)]
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Everything already buffered on the receiver
#[allow(dead_code)]
pub fn drain(events: &mut broadcast::Receiver<ManagerEvent>) -> Vec<EventKind> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event.kind),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return drained,
        }
    }
}

/// Names of the given events, in order
#[allow(dead_code)]
pub fn names(events: &[EventKind]) -> Vec<&'static str> {
    events.iter().map(EventKind::name).collect()
}

/// Number of events named `name`
#[allow(dead_code)]
pub fn count(events: &[EventKind], name: &str) -> usize {
    events.iter().filter(|kind| kind.name() == name).count()
}
