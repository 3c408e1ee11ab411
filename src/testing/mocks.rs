//! Mock transport for testing
//!
//! [`MockConnector`] plays a scripted sequence of handshake outcomes and hands out a
//! [`MockServer`] for every connection it accepts, so tests can push frames, drop
//! the connection and inspect what the manager wrote.

use crate::transport::{Connection, Connector, Frame, TransportError};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Scripted result of one connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Handshake succeeds
    Accept,
    /// Handshake succeeds after a delay
    AcceptAfter(Duration),
    /// Handshake fails with the given message
    Refuse(String),
    /// Handshake never completes
    Hang,
}

impl MockOutcome {
    pub fn refuse(message: impl Into<String>) -> Self {
        MockOutcome::Refuse(message.into())
    }
}

#[derive(Debug)]
struct ConnectorState {
    script: VecDeque<MockOutcome>,
    fallback: MockOutcome,
    auto_pong: bool,
    attempts: u32,
    endpoints: Vec<String>,
    servers: Vec<MockServer>,
}

/// Connector whose handshakes follow a script
#[derive(Debug, Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    /// Connector that accepts every attempt
    pub fn new() -> Self {
        Self::with_fallback(MockOutcome::Accept)
    }

    /// Connector that refuses every attempt
    pub fn refusing() -> Self {
        Self::with_fallback(MockOutcome::refuse("connection refused"))
    }

    /// Connector that uses `fallback` once the script runs out
    pub fn with_fallback(fallback: MockOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                script: VecDeque::new(),
                fallback,
                auto_pong: false,
                attempts: 0,
                endpoints: Vec::new(),
                servers: Vec::new(),
            })),
        }
    }

    /// Queue outcomes for the next attempts, in order
    pub fn with_script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.lock().script.extend(outcomes);
        self
    }

    /// Answer every ping with a pong echoing its timestamp
    pub fn with_auto_pong(self) -> Self {
        self.lock().auto_pong = true;
        self
    }

    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.lock().script.push_back(outcome);
    }

    pub fn set_fallback(&self, outcome: MockOutcome) {
        self.lock().fallback = outcome;
    }

    /// Number of handshakes started
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Endpoints passed to each handshake
    pub fn endpoints(&self) -> Vec<String> {
        self.lock().endpoints.clone()
    }

    /// Server side of the `index`th accepted connection
    pub fn server(&self, index: usize) -> Option<MockServer> {
        self.lock().servers.get(index).cloned()
    }

    /// Server side of the most recently accepted connection
    pub fn latest_server(&self) -> Option<MockServer> {
        self.lock().servers.last().cloned()
    }

    pub fn accepted(&self) -> usize {
        self.lock().servers.len()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_connection(&self) -> MockConnection {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(ConnectionLog {
            open: true,
            ..Default::default()
        }));
        let server = MockServer {
            inbound: tx.clone(),
            log: Arc::clone(&log),
        };

        let mut state = self.lock();
        state.servers.push(server);
        MockConnection {
            inbound: rx,
            loopback: tx,
            log,
            auto_pong: state.auto_pong,
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn Connection>, TransportError> {
        let outcome = {
            let mut state = self.lock();
            state.attempts += 1;
            state.endpoints.push(endpoint.to_string());
            let fallback = state.fallback.clone();
            state.script.pop_front().unwrap_or(fallback)
        };

        match outcome {
            MockOutcome::Accept => Ok(Box::new(self.open_connection())),
            MockOutcome::AcceptAfter(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Box::new(self.open_connection()))
            }
            MockOutcome::Refuse(message) => Err(TransportError::Handshake(message)),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}

/// Inbound item; `None` ends the stream without a close frame
type Inbound = Option<Result<Frame, TransportError>>;

#[derive(Debug, Default)]
struct ConnectionLog {
    sent: Vec<String>,
    closed: Option<(u16, String)>,
    fail_sends: bool,
    open: bool,
}

/// Server side of one accepted mock connection
#[derive(Debug, Clone)]
pub struct MockServer {
    inbound: mpsc::UnboundedSender<Inbound>,
    log: Arc<Mutex<ConnectionLog>>,
}

impl MockServer {
    /// Deliver a text frame to the client
    pub fn push_text(&self, payload: impl Into<String>) {
        let _ = self.inbound.send(Some(Ok(Frame::Text(payload.into()))));
    }

    /// Deliver a JSON value as a text frame
    pub fn push_json(&self, value: &Value) {
        self.push_text(value.to_string());
    }

    /// Reply to a ping
    pub fn pong(&self, timestamp: Option<i64>) {
        let reply = match timestamp {
            Some(timestamp) => json!({"type": "pong", "timestamp": timestamp}),
            None => json!({"type": "pong"}),
        };
        self.push_json(&reply);
    }

    /// Close from the server side with a close frame
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.lock().open = false;
        let _ = self.inbound.send(Some(Ok(Frame::Closed {
            code,
            reason: reason.into(),
        })));
    }

    /// Fail the read side with a transport error
    pub fn fail(&self, message: impl Into<String>) {
        self.lock().open = false;
        let _ = self
            .inbound
            .send(Some(Err(TransportError::Receive(message.into()))));
    }

    /// End the stream without a close frame
    pub fn drop_connection(&self) {
        self.lock().open = false;
        let _ = self.inbound.send(None);
    }

    /// Make every following write fail
    pub fn fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    /// Every frame the client wrote, pings included
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Frames the client wrote, excluding heartbeat pings
    pub fn sent_messages(&self) -> Vec<String> {
        self.lock()
            .sent
            .iter()
            .filter(|payload| !is_ping(payload))
            .cloned()
            .collect()
    }

    /// Heartbeat pings the client wrote
    pub fn pings(&self) -> usize {
        self.lock().sent.iter().filter(|p| is_ping(p)).count()
    }

    /// Close code and reason, if the client closed the connection
    pub fn closed_by_client(&self) -> Option<(u16, String)> {
        self.lock().closed.clone()
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionLog> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ping_timestamp(payload: &str) -> Option<Option<i64>> {
    let value: Value = serde_json::from_str(payload).ok()?;
    (value.get("type").and_then(Value::as_str) == Some("ping"))
        .then(|| value.get("timestamp").and_then(Value::as_i64))
}

fn is_ping(payload: &str) -> bool {
    ping_timestamp(payload).is_some()
}

/// Client side of a mock connection
struct MockConnection {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    loopback: mpsc::UnboundedSender<Inbound>,
    log: Arc<Mutex<ConnectionLog>>,
    auto_pong: bool,
}

impl MockConnection {
    fn lock(&self) -> MutexGuard<'_, ConnectionLog> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_text(&mut self, payload: &str) -> Result<(), TransportError> {
        {
            let mut log = self.lock();
            if log.fail_sends {
                return Err(TransportError::Send("mock write failure".to_string()));
            }
            if !log.open {
                return Err(TransportError::Send("connection is closed".to_string()));
            }
            log.sent.push(payload.to_string());
        }

        if self.auto_pong {
            if let Some(timestamp) = ping_timestamp(payload) {
                let pong = match timestamp {
                    Some(timestamp) => json!({"type": "pong", "timestamp": timestamp}),
                    None => json!({"type": "pong"}),
                };
                let _ = self
                    .loopback
                    .send(Some(Ok(Frame::Text(pong.to_string()))));
            }
        }
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        match self.inbound.recv().await {
            Some(Some(item)) => Some(item),
            Some(None) | None => {
                self.lock().open = false;
                None
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let mut log = self.lock();
        log.open = false;
        log.closed = Some((code, reason.to_string()));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}
