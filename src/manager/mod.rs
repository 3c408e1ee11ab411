//! Connection manager
//!
//! [`ConnectionManager`] is a cheap, cloneable handle to a task that owns one
//! persistent connection. The task reconnects with bounded exponential backoff,
//! gates every attempt through a [`CircuitBreaker`], buffers outbound messages while
//! disconnected and watches liveness with heartbeats.
//!
//! Module layout follows a pure/impure split: [`connection`], [`health_monitor`],
//! [`message_handler`] and [`queue`] hold decisions and data structures with no I/O;
//! `actor` wires them to the transport and timers.

mod actor;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod queue;

pub use actor::Delivery;
pub use connection::{ConnectionState, ReconnectPolicy};
pub use health_monitor::{HealthMonitor, ReconnectionDecision};
pub use message_handler::{InboundRoute, MessageHandler};
pub use queue::{MessageQueue, QueuedMessage};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::config::{validate_endpoint_url, ConnectionSection, LinkConfig};
use crate::error::{LinkError, LinkResult};
use crate::events::{EventBus, EventKind, ManagerEvent};
use crate::observability::metrics::MetricsSnapshot;
use crate::transport::{Connector, WsConnector};
use actor::{Command, ConnectionActor, PublishedState};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

const COMMAND_BUFFER: usize = 64;

/// Point-in-time view of a connection manager
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub endpoint: String,
    pub state: ConnectionState,
    pub connection_id: Option<Uuid>,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub queue_size: usize,
    pub reconnect_attempts: u32,
    pub metrics: MetricsSnapshot,
}

/// Handle to a managed persistent connection
///
/// Clones share the same connection. Dropping every clone tears the connection
/// down as if [`ConnectionManager::destroy`] had been called.
#[derive(Clone)]
pub struct ConnectionManager {
    endpoint: Arc<str>,
    commands: mpsc::Sender<Command>,
    published: watch::Receiver<PublishedState>,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.endpoint)
            .field("state", &self.published.borrow().state)
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager for a WebSocket endpoint
    ///
    /// Must be called from within a tokio runtime. No connection is opened until
    /// [`ConnectionManager::connect`].
    pub fn new(endpoint: &str, config: ConnectionSection) -> LinkResult<Self> {
        Self::with_connector(endpoint, config, Arc::new(WsConnector::new()))
    }

    /// Create a manager from a loaded configuration file
    pub fn from_config(config: &LinkConfig) -> LinkResult<Self> {
        Self::new(&config.endpoint.url, config.connection.clone())
    }

    /// Create a manager driving a custom transport
    pub fn with_connector(
        endpoint: &str,
        config: ConnectionSection,
        connector: Arc<dyn Connector>,
    ) -> LinkResult<Self> {
        validate_endpoint_url(endpoint)?;
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let events = EventBus::new(config.event_buffer);

        let breaker_events = events.clone();
        breaker.on_state_change(move |state, failure_count| {
            breaker_events.emit(EventKind::CircuitBreakerStateChange {
                state,
                failure_count,
            });
        });

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (published_tx, published_rx) = watch::channel(PublishedState::default());

        let actor = ConnectionActor::new(
            endpoint.to_string(),
            config,
            connector,
            Arc::clone(&breaker),
            events.clone(),
            command_rx,
            published_tx,
        );
        tokio::spawn(actor.run());

        info!(endpoint, "Connection manager created");

        Ok(Self {
            endpoint: Arc::from(endpoint),
            commands: command_tx,
            published: published_rx,
            breaker,
            events,
        })
    }

    /// Subscribe to lifecycle events
    ///
    /// Each subscriber receives every event emitted after it subscribed. A receiver
    /// that falls more than `event_buffer` events behind observes
    /// [`broadcast::error::RecvError::Lagged`]; after destroy it observes `Closed`.
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Open the connection
    ///
    /// Resolves once connected, the queue flushed and the heartbeat started. Already
    /// connected or connecting managers resolve immediately.
    pub async fn connect(&self) -> LinkResult<()> {
        self.request(|reply| Command::Connect { reply })
            .await
            .and_then(|result| result)
    }

    /// Send a text payload, or queue it until the next connection
    pub async fn send_text(&self, payload: impl Into<String>) -> LinkResult<Delivery> {
        let payload = payload.into();
        self.request(|reply| Command::Send { payload, reply }).await
    }

    /// Serialize a message as JSON and send it
    ///
    /// Serialization failures are returned before anything is queued.
    pub async fn send_json<T: Serialize + ?Sized>(&self, message: &T) -> LinkResult<Delivery> {
        let payload = MessageHandler::format_payload(message)?;
        self.send_text(payload).await
    }

    /// Close the connection and stop reconnecting until the next `connect`
    pub async fn disconnect(&self) -> LinkResult<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Disconnect, clear the queue, zero counters and metrics, then connect again
    ///
    /// The circuit breaker keeps its state.
    pub async fn reset(&self) -> LinkResult<()> {
        self.request(|reply| Command::Reset { reply })
            .await
            .and_then(|result| result)
    }

    /// Tear the manager down permanently
    ///
    /// Subscribers observe channel closure. Calling this again is a no-op; every
    /// other operation afterwards returns [`LinkError::Destroyed`].
    pub async fn destroy(&self) {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Destroy { reply }).await.is_ok() {
            let _ = response.await;
        }
    }

    /// Whether the manager has been torn down
    pub fn is_destroyed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Current state without waiting on the actor
    pub fn state(&self) -> ConnectionState {
        self.published.borrow().state
    }

    /// Synchronous snapshot of state, breaker, queue and metrics
    pub fn status(&self) -> ConnectionStatus {
        let published = self.published.borrow().clone();
        ConnectionStatus {
            endpoint: self.endpoint.to_string(),
            state: published.state,
            connection_id: published.connection_id,
            circuit_breaker: self.breaker.snapshot(),
            queue_size: published.queue_size,
            reconnect_attempts: published.reconnect_attempts,
            metrics: published.metrics.snapshot(Instant::now()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> LinkResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| LinkError::Destroyed)?;
        response.await.map_err(|_| LinkError::Destroyed)
    }
}
