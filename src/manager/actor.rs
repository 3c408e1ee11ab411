//! The connection actor
//!
//! One task owns the transport, the outbound queue, the reconnect timer, the
//! heartbeat and the metrics. Handles talk to it over an mpsc channel and read the
//! state it publishes on a watch channel. Handlers run one at a time, so nothing
//! here is locked.

use super::connection::{ConnectionState, ReconnectPolicy};
use super::health_monitor::{HealthMonitor, ReconnectionDecision};
use super::message_handler::{InboundRoute, MessageHandler};
use super::queue::{MessageQueue, QueuedMessage};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::ConnectionSection;
use crate::error::{sanitize_error_message, ErrorKind, LinkError, LinkResult};
use crate::events::{EventBus, EventKind};
use crate::observability::metrics::ConnectionMetrics;
use crate::transport::{
    Connection, Connector, Frame, TransportError, CLOSE_ABNORMAL, CLOSE_HEARTBEAT_MISSED,
    CLOSE_NORMAL,
};
use crate::{connection_span, lifecycle_span};
use chrono::Utc;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Upper bound on waiting for a close handshake before dropping the transport
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of an accepted outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the open transport
    Sent,
    /// Buffered until the next successful connection
    Queued,
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Send {
        payload: String,
        reply: oneshot::Sender<Delivery>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Reset {
        reply: oneshot::Sender<LinkResult<()>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// State the actor publishes after every handler
#[derive(Debug, Clone)]
pub(crate) struct PublishedState {
    pub state: ConnectionState,
    pub connection_id: Option<Uuid>,
    pub queue_size: usize,
    pub reconnect_attempts: u32,
    pub metrics: ConnectionMetrics,
}

impl Default for PublishedState {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            connection_id: None,
            queue_size: 0,
            reconnect_attempts: 0,
            metrics: ConnectionMetrics::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOrigin {
    Caller,
    Reconnect,
}

type AttemptFuture = Pin<Box<dyn Future<Output = LinkResult<Box<dyn Connection>>> + Send>>;

struct PendingAttempt {
    future: AttemptFuture,
    origin: AttemptOrigin,
    /// A caller attempt that replaced a scheduled reconnect
    resumes_reconnect: bool,
    waiter: Option<oneshot::Sender<LinkResult<()>>>,
}

pub(crate) struct ConnectionActor {
    endpoint: String,
    config: ConnectionSection,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    breaker: Arc<CircuitBreaker>,
    events: EventBus,
    commands: mpsc::Receiver<Command>,
    published: watch::Sender<PublishedState>,

    state: ConnectionState,
    connection: Option<Box<dyn Connection>>,
    attempt: Option<PendingAttempt>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
    last_pong: Instant,
    queue: MessageQueue,
    metrics: ConnectionMetrics,
    reconnect_attempts: u32,
    intentional_disconnect: bool,
    connection_id: Option<Uuid>,
}

impl ConnectionActor {
    pub(crate) fn new(
        endpoint: String,
        config: ConnectionSection,
        connector: Arc<dyn Connector>,
        breaker: Arc<CircuitBreaker>,
        events: EventBus,
        commands: mpsc::Receiver<Command>,
        published: watch::Sender<PublishedState>,
    ) -> Self {
        Self {
            endpoint,
            policy: ReconnectPolicy::from(&config),
            queue: MessageQueue::new(config.max_queue_size),
            config,
            connector,
            breaker,
            events,
            commands,
            published,
            state: ConnectionState::Disconnected,
            connection: None,
            attempt: None,
            reconnect_at: None,
            heartbeat: None,
            last_pong: Instant::now(),
            metrics: ConnectionMetrics::new(),
            reconnect_attempts: 0,
            intentional_disconnect: false,
            connection_id: None,
        }
    }

    /// Drive the manager until destroyed or every handle is dropped
    pub(crate) async fn run(mut self) {
        debug!(endpoint = %self.endpoint, "Connection actor started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Destroy { reply }) => {
                        self.destroy().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All manager handles dropped");
                        self.destroy().await;
                        break;
                    }
                },
                result = poll_attempt(&mut self.attempt) => self.finish_attempt(result).await,
                frame = next_frame(&mut self.connection) => self.handle_frame(frame).await,
                _ = reconnect_due(self.reconnect_at) => self.on_reconnect_timer(),
                _ = heartbeat_due(&mut self.heartbeat) => self.heartbeat_tick().await,
            }

            self.publish();
        }

        // Commands still buffered see their reply dropped
        self.commands.close();
        debug!(endpoint = %self.endpoint, "Connection actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Send { payload, reply } => {
                let delivery = self.send_message(payload).await;
                self.respond(reply, delivery);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                self.respond(reply, ());
            }
            Command::Reset { reply } => self.reset(reply).await,
            // Destroy ends the loop and is handled in `run`
            Command::Destroy { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, reply: oneshot::Sender<LinkResult<()>>) {
        if HealthMonitor::connect_is_noop(self.state) {
            debug!(state = %self.state, "Connect requested while already active");
            self.respond(reply, Ok(()));
            return;
        }

        let resumes_reconnect = self.reconnect_at.take().is_some();
        self.intentional_disconnect = false;
        self.begin_attempt(AttemptOrigin::Caller, Some(reply));
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.resumes_reconnect = resumes_reconnect;
        }
    }

    /// Start a breaker-gated connection attempt bounded by the connection timeout
    fn begin_attempt(
        &mut self,
        origin: AttemptOrigin,
        waiter: Option<oneshot::Sender<LinkResult<()>>>,
    ) {
        let connection_id = Uuid::new_v4();
        self.connection_id = Some(connection_id);
        self.events.set_connection_id(connection_id);

        let reconnect_attempt = match origin {
            AttemptOrigin::Caller => 0,
            AttemptOrigin::Reconnect => self.reconnect_attempts,
        };
        self.events.emit(EventKind::Connecting { reconnect_attempt });
        self.transition(ConnectionState::Connecting);

        let breaker = Arc::clone(&self.breaker);
        let connector = Arc::clone(&self.connector);
        let endpoint = self.endpoint.clone();
        let timeout = self.config.connection_timeout();
        let span = connection_span!(
            %connection_id,
            reconnect_attempt,
            origin = ?origin
        );

        let future = async move {
            breaker
                .execute(move || async move {
                    match tokio::time::timeout(timeout, connector.connect(&endpoint)).await {
                        Ok(Ok(connection)) => Ok(connection),
                        Ok(Err(e)) => Err(LinkError::from(e)),
                        Err(_) => Err(LinkError::ConnectionTimeout {
                            timeout_ms: duration_ms(timeout),
                        }),
                    }
                })
                .await
                .map_err(|e| match e {
                    CircuitBreakerError::Open { retry_after } => LinkError::CircuitOpen {
                        retry_after_ms: duration_ms(retry_after),
                    },
                    CircuitBreakerError::Operation(e) => e,
                })
        }
        .instrument(span);

        self.attempt = Some(PendingAttempt {
            future: Box::pin(future),
            origin,
            resumes_reconnect: false,
            waiter,
        });
    }

    async fn finish_attempt(&mut self, result: LinkResult<Box<dyn Connection>>) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };

        match result {
            Ok(connection) => {
                self.connection = Some(connection);
                self.on_connection_open().await;
                if let Some(waiter) = attempt.waiter {
                    self.respond(waiter, Ok(()));
                }
            }
            Err(e) => {
                let message = sanitize_error_message(&e.to_string());
                self.transition(ConnectionState::Disconnected);
                self.metrics.error_recorded();

                match attempt.origin {
                    AttemptOrigin::Caller => {
                        error!(error = %message, "Connection attempt failed");
                        let kind = e.kind().unwrap_or(ErrorKind::ConnectionError);
                        self.events.emit(EventKind::Error {
                            kind,
                            message,
                            raw: None,
                        });
                        // A refused handshake is followed by a close, so it retries.
                        // An interrupted reconnect schedule keeps its remaining budget.
                        if e.is_transport_failure() || attempt.resumes_reconnect {
                            self.schedule_reconnect();
                        }
                    }
                    AttemptOrigin::Reconnect => {
                        warn!(
                            attempt = self.reconnect_attempts,
                            error = %message,
                            "Reconnect attempt failed"
                        );
                        self.events.emit(EventKind::ReconnectError {
                            attempt: self.reconnect_attempts,
                            error: message,
                        });
                        self.schedule_reconnect();
                    }
                }

                if let Some(waiter) = attempt.waiter {
                    self.respond(waiter, Err(e));
                }
            }
        }
    }

    async fn on_connection_open(&mut self) {
        self.transition(ConnectionState::Connected);
        self.reconnect_attempts = 0;
        self.metrics.connection_opened();
        info!(endpoint = %self.endpoint, connection_id = ?self.connection_id, "Connected");
        self.events.emit(EventKind::Connected);

        self.flush_queue().await;
        self.start_heartbeat();
    }

    async fn handle_frame(&mut self, frame: Option<Result<Frame, TransportError>>) {
        match frame {
            Some(Ok(Frame::Text(raw))) => self.handle_text(raw),
            Some(Ok(Frame::Closed { code, reason })) => {
                self.connection = None;
                self.on_connection_close(Some(code), reason);
            }
            Some(Err(e)) => {
                self.report_error(ErrorKind::ConnectionError, e.to_string(), None);
                self.connection = None;
                self.on_connection_close(Some(CLOSE_ABNORMAL), e.to_string());
            }
            None => {
                self.connection = None;
                self.on_connection_close(Some(CLOSE_ABNORMAL), "Connection dropped".to_string());
            }
        }
    }

    fn handle_text(&mut self, raw: String) {
        self.metrics.message_received();

        match MessageHandler::route_inbound(&raw) {
            InboundRoute::Pong { timestamp } => {
                self.last_pong = Instant::now();
                let latency_ms =
                    HealthMonitor::pong_latency_ms(timestamp, Utc::now().timestamp_millis());
                debug!(?latency_ms, "Heartbeat response");
                self.events.emit(EventKind::HeartbeatResponse { latency_ms });
            }
            InboundRoute::Message { data } => {
                debug!(bytes = raw.len(), "Inbound message");
                self.events.emit(EventKind::Message { data, raw });
            }
            InboundRoute::Malformed { error } => {
                self.report_error(ErrorKind::MessageParseError, error, Some(raw));
            }
        }
    }

    /// Transport is gone; record it and decide whether to come back
    fn on_connection_close(&mut self, code: Option<u16>, reason: String) {
        self.heartbeat = None;
        self.reconnect_at = None;
        self.metrics.connection_closed();
        self.transition(ConnectionState::Disconnected);

        let reason = sanitize_error_message(&reason);
        warn!(
            ?code,
            reason = %reason,
            intentional = self.intentional_disconnect,
            "Connection closed"
        );
        self.events.emit(EventKind::Disconnected {
            code,
            reason,
            intentional: self.intentional_disconnect,
        });

        if !self.intentional_disconnect {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        match HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.policy,
            self.intentional_disconnect,
        ) {
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.reconnect_attempts = attempt;
                self.metrics.reconnect_attempted();
                self.transition(ConnectionState::Reconnecting);

                let delay_ms = duration_ms(delay);
                warn!(
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    delay_ms,
                    "Scheduling reconnect"
                );
                self.events.emit(EventKind::Reconnecting { attempt, delay_ms });
                self.reconnect_at = Some(Instant::now() + delay);
            }
            decision => {
                let reason = decision
                    .abort_reason()
                    .unwrap_or("reconnection stopped")
                    .to_string();
                error!(
                    attempts = self.reconnect_attempts,
                    reason = %reason,
                    "Giving up on reconnection"
                );
                self.events.emit(EventKind::ReconnectFailed {
                    attempts: self.reconnect_attempts,
                    reason,
                });
            }
        }
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        info!(attempt = self.reconnect_attempts, "Reconnect delay elapsed");
        self.begin_attempt(AttemptOrigin::Reconnect, None);
    }

    async fn send_message(&mut self, payload: String) -> Delivery {
        if self.try_write(&payload).await {
            self.events.emit(EventKind::MessageSent { payload });
            return Delivery::Sent;
        }

        self.queue_message(QueuedMessage::new(payload));
        Delivery::Queued
    }

    /// Write to the transport if connected; false means the caller should queue
    async fn try_write(&mut self, payload: &str) -> bool {
        if !HealthMonitor::can_send(self.state) {
            return false;
        }
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        if !connection.is_open() {
            return false;
        }

        match connection.send_text(payload).await {
            Ok(()) => {
                self.metrics.message_sent();
                true
            }
            Err(e) => {
                self.report_error(ErrorKind::SendError, e.to_string(), None);
                false
            }
        }
    }

    fn queue_message(&mut self, message: QueuedMessage) {
        if let Some(dropped) = self.queue.push(message) {
            warn!(
                capacity = self.queue.capacity(),
                enqueued_at = %dropped.enqueued_at,
                "Queue full, dropped oldest message"
            );
            self.events.emit(EventKind::MessageDropped {
                message: dropped,
                queue_size: self.queue.len(),
            });
        }
        debug!(queue_size = self.queue.len(), "Message queued");
    }

    /// Send everything queued, in order; failures go back through the queue
    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        let pending = self.queue.take_all();
        info!(count = pending.len(), "Flushing queued messages");

        for mut message in pending {
            if self.try_write(&message.payload).await {
                self.events.emit(EventKind::MessageSent {
                    payload: message.payload.clone(),
                });
                self.events.emit(EventKind::QueuedMessageSent { message });
            } else {
                message.attempts += 1;
                self.queue_message(message);
            }
        }
    }

    fn start_heartbeat(&mut self) {
        self.last_pong = Instant::now();
        self.heartbeat = self.config.heartbeat_interval().map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
    }

    async fn heartbeat_tick(&mut self) {
        let Some(period) = self.config.heartbeat_interval() else {
            self.heartbeat = None;
            return;
        };

        let ping = MessageHandler::build_ping_payload(Utc::now().timestamp_millis());
        if let Some(connection) = self.connection.as_mut() {
            if let Err(e) = connection.send_text(&ping).await {
                self.report_error(ErrorKind::SendError, e.to_string(), None);
            }
        }

        let last_pong_age = self.last_pong.elapsed();
        if HealthMonitor::heartbeat_expired(last_pong_age, period) {
            let last_pong_age_ms = duration_ms(last_pong_age);
            warn!(last_pong_age_ms, "Heartbeat missed, forcing reconnect");
            self.events
                .emit(EventKind::HeartbeatMissed { last_pong_age_ms });

            self.close_transport(CLOSE_HEARTBEAT_MISSED, "Heartbeat missed")
                .await;
            self.on_connection_close(
                Some(CLOSE_HEARTBEAT_MISSED),
                "Heartbeat missed".to_string(),
            );
        }
    }

    async fn disconnect(&mut self) {
        let span = lifecycle_span!(operation = "disconnect", state = %self.state);
        self.close_intentionally().instrument(span).await;
    }

    async fn close_intentionally(&mut self) {
        self.intentional_disconnect = true;
        self.reconnect_at = None;
        self.heartbeat = None;
        self.cancel_attempt(|| LinkError::cancelled("disconnect requested"));

        if self.connection.is_some() {
            self.close_transport(CLOSE_NORMAL, "Client disconnect").await;
            self.metrics.connection_closed();
        }

        self.transition(ConnectionState::Disconnected);
        info!("Disconnected by caller");
        self.events.emit(EventKind::Disconnected {
            code: Some(CLOSE_NORMAL),
            reason: "Client disconnect".to_string(),
            intentional: true,
        });
    }

    async fn reset(&mut self, reply: oneshot::Sender<LinkResult<()>>) {
        info!("Resetting connection manager");
        self.disconnect().await;
        self.reconnect_attempts = 0;
        self.queue.clear();
        self.metrics.reset();
        self.connect(reply);
    }

    async fn destroy(&mut self) {
        let span = lifecycle_span!(operation = "destroy", state = %self.state);
        self.tear_down().instrument(span).await;
    }

    async fn tear_down(&mut self) {
        self.intentional_disconnect = true;
        self.reconnect_at = None;
        self.heartbeat = None;
        self.cancel_attempt(|| LinkError::Destroyed);
        self.events.detach_all();

        if self.connection.is_some() {
            self.close_transport(CLOSE_NORMAL, "Manager destroyed").await;
            self.metrics.connection_closed();
        }

        self.transition(ConnectionState::Disconnected);
        self.publish();
        info!(endpoint = %self.endpoint, "Connection manager destroyed");
    }

    /// Drop the in-flight attempt, failing its waiter
    fn cancel_attempt(&mut self, error: impl FnOnce() -> LinkError) {
        if let Some(attempt) = self.attempt.take() {
            debug!(origin = ?attempt.origin, "Cancelling in-flight connection attempt");
            if let Some(waiter) = attempt.waiter {
                let _ = waiter.send(Err(error()));
            }
        }
    }

    /// Close and drop the transport, bounded by the close timeout
    async fn close_transport(&mut self, code: u16, reason: &str) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };

        match tokio::time::timeout(CLOSE_TIMEOUT, connection.close(code, reason)).await {
            Ok(Ok(())) => debug!(code, "Transport closed"),
            Ok(Err(e)) => debug!(code, error = %e, "Transport close failed"),
            Err(_) => debug!(code, "Transport close timed out"),
        }
    }

    fn report_error(&mut self, kind: ErrorKind, message: String, raw: Option<String>) {
        self.metrics.error_recorded();
        let message = sanitize_error_message(&message);
        warn!(kind = %kind, error = %message, "Connection manager error");
        self.events.emit(EventKind::Error { kind, message, raw });
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state != to {
            HealthMonitor::log_state_transition(self.state, to);
            self.state = to;
        }
    }

    /// Publish state, then answer the caller so it never observes a stale status
    fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = reply.send(value);
    }

    fn publish(&self) {
        self.published.send_replace(PublishedState {
            state: self.state,
            connection_id: self.connection_id,
            queue_size: self.queue.len(),
            reconnect_attempts: self.reconnect_attempts,
            metrics: self.metrics.clone(),
        });
    }
}

async fn poll_attempt(attempt: &mut Option<PendingAttempt>) -> LinkResult<Box<dyn Connection>> {
    match attempt {
        Some(attempt) => attempt.future.as_mut().await,
        None => pending().await,
    }
}

async fn next_frame(
    connection: &mut Option<Box<dyn Connection>>,
) -> Option<Result<Frame, TransportError>> {
    match connection {
        Some(connection) => connection.next_frame().await,
        None => pending().await,
    }
}

async fn reconnect_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn heartbeat_due(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
