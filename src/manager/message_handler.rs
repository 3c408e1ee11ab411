//! Pure message routing for inbound and outbound frames
//!
//! Inbound text is parsed once and routed either to the heartbeat tracker or to
//! subscribers; outbound heartbeat payloads are built here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heartbeat control message exchanged with the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Pure message routing decisions
pub struct MessageHandler;

impl MessageHandler {
    /// Route an inbound text frame
    pub fn route_inbound(raw: &str) -> InboundRoute {
        let data: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return InboundRoute::Malformed {
                    error: format!("Failed to parse message: {e}"),
                }
            }
        };

        if data.get("type").and_then(Value::as_str) == Some("pong") {
            return InboundRoute::Pong {
                timestamp: data.get("timestamp").and_then(Value::as_i64),
            };
        }

        InboundRoute::Message { data }
    }

    /// Build the ping payload for a heartbeat tick
    pub fn build_ping_payload(timestamp_ms: i64) -> String {
        let ping = HeartbeatMessage {
            message_type: "ping".to_string(),
            timestamp: Some(timestamp_ms),
        };
        // A two-field struct of strings and integers always serializes
        serde_json::to_string(&ping)
            .unwrap_or_else(|_| format!(r#"{{"type":"ping","timestamp":{timestamp_ms}}}"#))
    }

    /// Serialize a structured outbound message to its text payload
    pub fn format_payload<T: Serialize + ?Sized>(message: &T) -> Result<String, serde_json::Error> {
        serde_json::to_string(message)
    }
}

/// Routing decisions for inbound frames
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRoute {
    /// Heartbeat reply, intercepted before subscribers
    Pong { timestamp: Option<i64> },
    /// Application message
    Message { data: Value },
    /// Not valid JSON
    Malformed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_pong() {
        let route = MessageHandler::route_inbound(r#"{"type":"pong","timestamp":1700000000000}"#);
        assert_eq!(
            route,
            InboundRoute::Pong {
                timestamp: Some(1_700_000_000_000)
            }
        );
    }

    #[test]
    fn test_route_pong_without_timestamp() {
        let route = MessageHandler::route_inbound(r#"{"type":"pong"}"#);
        assert_eq!(route, InboundRoute::Pong { timestamp: None });
    }

    #[test]
    fn test_route_application_message() {
        let route = MessageHandler::route_inbound(r#"{"type":"trade","price":42}"#);
        assert_eq!(
            route,
            InboundRoute::Message {
                data: json!({"type": "trade", "price": 42})
            }
        );
    }

    #[test]
    fn test_ping_type_from_server_is_application_message() {
        let route = MessageHandler::route_inbound(r#"{"type":"ping","timestamp":5}"#);
        assert!(matches!(route, InboundRoute::Message { .. }));
    }

    #[test]
    fn test_route_non_object_json() {
        let route = MessageHandler::route_inbound("[1,2,3]");
        assert_eq!(
            route,
            InboundRoute::Message {
                data: json!([1, 2, 3])
            }
        );
    }

    #[test]
    fn test_route_malformed() {
        let route = MessageHandler::route_inbound("{not json");
        match route {
            InboundRoute::Malformed { error } => assert!(error.contains("Failed to parse")),
            other => panic!("expected malformed route, got {other:?}"),
        }
    }

    #[test]
    fn test_build_ping_payload() {
        let payload = MessageHandler::build_ping_payload(1234);
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value, json!({"type": "ping", "timestamp": 1234}));
    }

    #[test]
    fn test_format_payload() {
        let payload = MessageHandler::format_payload(&json!({"op": "subscribe"})).unwrap();
        assert_eq!(payload, r#"{"op":"subscribe"}"#);
    }
}
