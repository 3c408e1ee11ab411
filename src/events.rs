//! Notification surface for connection lifecycle events
//!
//! Events are delivered over a `tokio::sync::broadcast` channel. Each subscriber owns
//! its receiver, so a slow subscriber only lags itself and a failing one cannot
//! reach the manager's state. Tearing the bus down drops the sender, which every
//! receiver observes as `RecvError::Closed`.

use crate::circuit_breaker::CircuitState;
use crate::error::ErrorKind;
use crate::manager::queue::QueuedMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// One emitted notification
#[derive(Debug, Clone, Serialize)]
pub struct ManagerEvent {
    /// Identifier of the current (or most recent) connection attempt
    pub connection_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Named signals and their payloads
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EventKind {
    /// A connection attempt is starting
    Connecting { reconnect_attempt: u32 },
    /// The transport is open
    Connected,
    /// The transport closed or was closed by the caller
    Disconnected {
        code: Option<u16>,
        reason: String,
        intentional: bool,
    },
    /// Inbound application message
    Message {
        data: serde_json::Value,
        raw: String,
    },
    /// Non-fatal error report
    Error {
        kind: ErrorKind,
        message: String,
        raw: Option<String>,
    },
    /// A reconnect attempt has been scheduled
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// A scheduled reconnect attempt failed
    ReconnectError { attempt: u32, error: String },
    /// Reconnection has stopped until an explicit connect or reset
    ReconnectFailed { attempts: u32, reason: String },
    /// No pong arrived within two heartbeat intervals
    HeartbeatMissed { last_pong_age_ms: u64 },
    /// Circuit breaker transitioned
    CircuitBreakerStateChange {
        state: CircuitState,
        failure_count: u32,
    },
    /// The oldest queued message was evicted to make room
    MessageDropped {
        message: QueuedMessage,
        queue_size: usize,
    },
    /// A previously queued message reached the wire
    QueuedMessageSent { message: QueuedMessage },
    /// Pong received
    HeartbeatResponse { latency_ms: Option<i64> },
    /// A message was written to the wire
    MessageSent { payload: String },
}

impl EventKind {
    /// Wire name of the signal
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Connecting { .. } => "connecting",
            EventKind::Connected => "connected",
            EventKind::Disconnected { .. } => "disconnected",
            EventKind::Message { .. } => "message",
            EventKind::Error { .. } => "error",
            EventKind::Reconnecting { .. } => "reconnecting",
            EventKind::ReconnectError { .. } => "reconnectError",
            EventKind::ReconnectFailed { .. } => "reconnectFailed",
            EventKind::HeartbeatMissed { .. } => "heartbeatMissed",
            EventKind::CircuitBreakerStateChange { .. } => "circuitBreakerStateChange",
            EventKind::MessageDropped { .. } => "messageDropped",
            EventKind::QueuedMessageSent { .. } => "queuedMessageSent",
            EventKind::HeartbeatResponse { .. } => "heartbeatResponse",
            EventKind::MessageSent { .. } => "messageSent",
        }
    }
}

struct BusState {
    sender: Option<broadcast::Sender<ManagerEvent>>,
    connection_id: Option<Uuid>,
}

/// Shared emitter; clones refer to the same channel
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(BusState {
                sender: Some(sender),
                connection_id: None,
            })),
        }
    }

    /// Subscribe to future events
    ///
    /// After [`EventBus::detach_all`] the returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        match &self.lock().sender {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(1);
                drop(sender);
                receiver
            }
        }
    }

    /// Emit an event stamped with the current connection id
    pub fn emit(&self, kind: EventKind) {
        let state = self.lock();
        let Some(sender) = &state.sender else {
            return;
        };

        trace!(event = kind.name(), "Emitting event");
        let event = ManagerEvent {
            connection_id: state.connection_id,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is not an error
        let _ = sender.send(event);
    }

    pub fn set_connection_id(&self, connection_id: Uuid) {
        self.lock().connection_id = Some(connection_id);
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.lock().connection_id
    }

    /// Drop the sender so every subscriber sees the channel close
    pub fn detach_all(&self) {
        self.lock().sender = None;
    }

    pub fn is_detached(&self) -> bool {
        self.lock().sender.is_none()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_emit_stamps_connection_id() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.set_connection_id(id);
        bus.emit(EventKind::Connected);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.connection_id, Some(id));
        assert!(matches!(event.kind, EventKind::Connected));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        bus.emit(EventKind::Connected);
        assert!(!bus.is_detached());
    }

    #[tokio::test]
    async fn test_detach_closes_receivers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.detach_all();

        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));

        let mut late = bus.subscribe();
        assert!(matches!(late.recv().await, Err(RecvError::Closed)));
    }

    #[test]
    fn test_event_serialization_uses_signal_names() {
        let event = ManagerEvent {
            connection_id: None,
            timestamp: Utc::now(),
            kind: EventKind::Reconnecting {
                attempt: 2,
                delay_ms: 2000,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "reconnecting");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["delay_ms"], 2000);

        let kind = EventKind::CircuitBreakerStateChange {
            state: CircuitState::Open,
            failure_count: 3,
        };
        assert_eq!(kind.name(), "circuitBreakerStateChange");
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["event"], "circuitBreakerStateChange");
        assert_eq!(json["state"], "OPEN");
    }
}
