//! resilink - Resilient persistent connection client
//!
//! Maintains a long-lived WebSocket text stream to one endpoint and keeps it healthy.
//!
//! # Overview
//!
//! This crate provides:
//! - A [`CircuitBreaker`] gating connection attempts against an unhealthy endpoint
//! - A [`ConnectionManager`] that reconnects with bounded exponential backoff
//! - A bounded outbound queue that survives reconnect cycles in order
//! - Heartbeats that force a reconnect when the peer stops answering
//! - Lifecycle events delivered over a broadcast channel
//!
//! # Quick Start
//!
//! ```rust
//! use resilink::testing::MockConnector;
//! use resilink::{ConnectionManager, ConnectionSection, ConnectionState, Delivery};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! tokio_test::block_on(async {
//!     let connector = Arc::new(MockConnector::new());
//!     let manager = ConnectionManager::with_connector(
//!         "wss://stream.example.com/feed",
//!         ConnectionSection::default(),
//!         connector.clone(),
//!     )
//!     .unwrap();
//!
//!     // Messages sent before connecting are queued and flushed in order
//!     let delivery = manager.send_json(&json!({"op": "subscribe"})).await.unwrap();
//!     assert_eq!(delivery, Delivery::Queued);
//!
//!     manager.connect().await.unwrap();
//!     assert_eq!(manager.state(), ConnectionState::Connected);
//!     assert_eq!(manager.status().queue_size, 0);
//!
//!     manager.destroy().await;
//! });
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod observability;
pub mod testing;
pub mod transport;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerSnapshot, CircuitState,
};
pub use config::{CircuitBreakerSection, ConfigError, ConnectionSection, LinkConfig};
pub use error::{ErrorKind, LinkError, LinkResult};
pub use events::{EventBus, EventKind, ManagerEvent};
pub use manager::{ConnectionManager, ConnectionState, ConnectionStatus, Delivery, QueuedMessage};
pub use observability::MetricsSnapshot;
pub use transport::{Connection, Connector, Frame, TransportError, WsConnector};
