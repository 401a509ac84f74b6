//! WebSocket wire format
//!
//! Every frame is a UTF-8 JSON object `{type, ref?, payload?}`. Unknown
//! fields are ignored; an unknown `type` earns an `error` frame but never
//! closes the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::Envelope;
use super::keys::RoutingKey;

/// A raw client frame before command validation
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(rename = "ref")]
    pub reference: Option<String>,

    #[serde(default)]
    pub payload: Value,
}

/// Validated client commands
#[derive(Debug, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe { keys: Vec<String> },
    Unsubscribe { keys: Vec<String> },
    Ping,
}

/// Why a client frame was rejected
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid payload: {0}")]
    BadPayload(String),
}

#[derive(Debug, Deserialize)]
struct KeysPayload {
    keys: Vec<String>,
}

impl ClientFrame {
    /// Parse a text frame off the socket
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Interpret the frame as a command
    pub fn command(&self) -> Result<ClientCommand, ProtocolError> {
        match self.kind.as_str() {
            "subscribe" => Ok(ClientCommand::Subscribe {
                keys: self.keys_payload()?,
            }),
            "unsubscribe" => Ok(ClientCommand::Unsubscribe {
                keys: self.keys_payload()?,
            }),
            "ping" => Ok(ClientCommand::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    fn keys_payload(&self) -> Result<Vec<String>, ProtocolError> {
        let payload: KeysPayload = serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::BadPayload(e.to_string()))?;
        if payload.keys.is_empty() {
            return Err(ProtocolError::BadPayload("keys must be non-empty".into()));
        }
        Ok(payload.keys)
    }
}

/// Frames the server writes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Broadcast from the hub
    Event {
        event_type: String,
        data: Value,
        keys: Vec<RoutingKey>,
    },
    /// Acknowledges the most recent client frame carrying `ref`
    Ack {
        #[serde(rename = "ref")]
        reference: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Terminal for the offending message only, not the connection
    Error { code: String, message: String },
    /// Reply to an application-level ping
    Pong {},
}

impl ServerMessage {
    /// The broadcast frame for a bus envelope
    pub fn event(envelope: &Envelope) -> Self {
        Self::Event {
            event_type: envelope.event_type.as_str().to_string(),
            data: envelope.payload.clone(),
            keys: envelope.keys.clone(),
        }
    }

    pub fn ack(reference: impl Into<String>) -> Self {
        Self::Ack {
            reference: reference.into(),
            ok: true,
            error: None,
        }
    }

    pub fn nack(reference: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Ack {
            reference: reference.into(),
            ok: false,
            error: Some(error.into()),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Serialize to the JSON text the writer puts on the socket
    pub fn to_json(&self) -> String {
        // Serialization of these enums cannot fail; the fallback is defensive
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","payload":{"code":"INTERNAL_ERROR","message":"serialization failure"}}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscribe_frame_parses() {
        let frame = ClientFrame::parse(
            r#"{"type":"subscribe","ref":"r1","payload":{"keys":["post:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"]}}"#,
        )
        .unwrap();
        assert_eq!(frame.reference.as_deref(), Some("r1"));
        assert_eq!(
            frame.command().unwrap(),
            ClientCommand::Subscribe {
                keys: vec!["post:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb".into()]
            }
        );
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let frame =
            ClientFrame::parse(r#"{"type":"ping","future_field":true,"payload":{}}"#).unwrap();
        assert_eq!(frame.command().unwrap(), ClientCommand::Ping);
    }

    #[test]
    fn ping_needs_no_payload() {
        let frame = ClientFrame::parse(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame.command().unwrap(), ClientCommand::Ping);
    }

    #[test]
    fn unknown_type_is_a_protocol_error() {
        let frame = ClientFrame::parse(r#"{"type":"teleport","payload":{}}"#).unwrap();
        assert!(matches!(
            frame.command(),
            Err(ProtocolError::UnknownType(t)) if t == "teleport"
        ));
    }

    #[test]
    fn subscribe_without_keys_is_rejected() {
        let frame = ClientFrame::parse(r#"{"type":"subscribe","payload":{}}"#).unwrap();
        assert!(matches!(frame.command(), Err(ProtocolError::BadPayload(_))));

        let frame = ClientFrame::parse(r#"{"type":"subscribe","payload":{"keys":[]}}"#).unwrap();
        assert!(matches!(frame.command(), Err(ProtocolError::BadPayload(_))));
    }

    #[test]
    fn server_frames_nest_payload_under_type() {
        let ack = ServerMessage::ack("r9").to_json();
        let value: serde_json::Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(value["type"], "ack");
        assert_eq!(value["payload"]["ref"], "r9");
        assert_eq!(value["payload"]["ok"], true);
        assert!(value["payload"].get("error").is_none());

        let nack = ServerMessage::nack("r9", "FORBIDDEN").to_json();
        let value: serde_json::Value = serde_json::from_str(&nack).unwrap();
        assert_eq!(value["payload"]["ok"], false);
        assert_eq!(value["payload"]["error"], "FORBIDDEN");

        let pong = ServerMessage::Pong {}.to_json();
        let value: serde_json::Value = serde_json::from_str(&pong).unwrap();
        assert_eq!(value["type"], "pong");
    }

    #[test]
    fn event_frame_carries_taxonomy_and_keys() {
        use crate::realtime::event::{Envelope, Event};
        use uuid::Uuid;

        let post = Uuid::new_v4();
        let envelope = Envelope::new(
            Event::comment_created(post, json!({"post_id": post})),
            Uuid::new_v4(),
        );
        let frame = ServerMessage::event(&envelope).to_json();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(value["type"], "event");
        assert_eq!(value["payload"]["event_type"], "comment.created");
        assert_eq!(
            value["payload"]["keys"][0],
            format!("post:{post}")
        );
    }
}
