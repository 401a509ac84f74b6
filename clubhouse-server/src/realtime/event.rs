//! Event taxonomy and the cross-process envelope
//!
//! Domain handlers construct typed events and hand them to the bus; the
//! envelope adds the version, timestamp, and producer id needed on the
//! shared channel. Unknown types and malformed envelopes are rejected at
//! this boundary, never deeper in the code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::keys::RoutingKey;

/// Envelope version understood by this build
pub const ENVELOPE_VERSION: u8 = 1;

/// The closed set of event types crossing the realtime plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "post.created")]
    PostCreated,
    #[serde(rename = "comment.created")]
    CommentCreated,
    #[serde(rename = "reaction.added")]
    ReactionAdded,
    #[serde(rename = "notification.created")]
    NotificationCreated,
    #[serde(rename = "notification.read")]
    NotificationRead,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostCreated => "post.created",
            Self::CommentCreated => "comment.created",
            Self::ReactionAdded => "reaction.added",
            Self::NotificationCreated => "notification.created",
            Self::NotificationRead => "notification.read",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post.created" => Ok(Self::PostCreated),
            "comment.created" => Ok(Self::CommentCreated),
            "reaction.added" => Ok(Self::ReactionAdded),
            "notification.created" => Ok(Self::NotificationCreated),
            "notification.read" => Ok(Self::NotificationRead),
            _ => Err(()),
        }
    }
}

/// A typed event as handed to the bus by a producer
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: EventType,
    pub keys: Vec<RoutingKey>,
    pub payload: Value,
}

impl Event {
    /// A new post in a section; fans out to section subscribers
    pub fn post_created(section_id: Uuid, payload: Value) -> Self {
        Self {
            event_type: EventType::PostCreated,
            keys: vec![RoutingKey::Section(section_id)],
            payload,
        }
    }

    /// A new comment on a post; fans out to post subscribers
    pub fn comment_created(post_id: Uuid, payload: Value) -> Self {
        Self {
            event_type: EventType::CommentCreated,
            keys: vec![RoutingKey::Post(post_id)],
            payload,
        }
    }

    /// A reaction added to a post
    pub fn reaction_added(post_id: Uuid, payload: Value) -> Self {
        Self {
            event_type: EventType::ReactionAdded,
            keys: vec![RoutingKey::Post(post_id)],
            payload,
        }
    }

    /// A notification persisted for a user
    pub fn notification_created(user_id: Uuid, payload: Value) -> Self {
        Self {
            event_type: EventType::NotificationCreated,
            keys: vec![RoutingKey::User(user_id)],
            payload,
        }
    }

    /// Notifications marked read, so other tabs update their badge
    pub fn notification_read(user_id: Uuid, payload: Value) -> Self {
        Self {
            event_type: EventType::NotificationRead,
            keys: vec![RoutingKey::User(user_id)],
            payload,
        }
    }
}

/// The versioned wire envelope on the shared pub/sub channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub keys: Vec<RoutingKey>,
    pub payload: Value,
    pub produced_at: DateTime<Utc>,
    pub producer_id: Uuid,
}

/// Why an inbound message was dropped at the boundary
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported envelope version {0}")]
    Version(u8),
    #[error("envelope carries no routing keys")]
    NoKeys,
}

impl Envelope {
    /// Wrap an event for publication
    pub fn new(event: Event, producer_id: Uuid) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            event_type: event.event_type,
            keys: event.keys,
            payload: event.payload,
            produced_at: Utc::now(),
            producer_id,
        }
    }

    /// Decode and sanity-check an inbound message
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(raw)?;

        if envelope.v != ENVELOPE_VERSION {
            return Err(DecodeError::Version(envelope.v));
        }
        if envelope.keys.is_empty() {
            return Err(DecodeError::NoKeys);
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips() {
        let post_id = Uuid::new_v4();
        let producer = Uuid::new_v4();
        let event = Event::comment_created(post_id, json!({"comment_id": "c1", "post_id": post_id}));

        let envelope = Envelope::new(event, producer);
        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded = Envelope::decode(&wire).unwrap();

        assert_eq!(decoded.v, 1);
        assert_eq!(decoded.event_type, EventType::CommentCreated);
        assert_eq!(decoded.keys, vec![RoutingKey::Post(post_id)]);
        assert_eq!(decoded.producer_id, producer);
    }

    #[test]
    fn event_types_use_dotted_names() {
        let wire = serde_json::to_string(&EventType::NotificationCreated).unwrap();
        assert_eq!(wire, "\"notification.created\"");
        assert_eq!(
            "reaction.added".parse::<EventType>().unwrap(),
            EventType::ReactionAdded
        );
        assert!("reaction.removed".parse::<EventType>().is_err());
    }

    #[test]
    fn unknown_type_is_rejected_at_decode() {
        let raw = r#"{"v":1,"type":"post.exploded","keys":["post:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"],"payload":{},"produced_at":"2026-01-01T00:00:00Z","producer_id":"6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"}"#;
        assert!(matches!(Envelope::decode(raw), Err(DecodeError::Json(_))));
    }

    #[test]
    fn wrong_version_is_rejected() {
        let raw = r#"{"v":2,"type":"post.created","keys":["section:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"],"payload":{},"produced_at":"2026-01-01T00:00:00Z","producer_id":"6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"}"#;
        assert!(matches!(Envelope::decode(raw), Err(DecodeError::Version(2))));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let raw = r#"{"v":1,"type":"post.created","keys":[],"payload":{},"produced_at":"2026-01-01T00:00:00Z","producer_id":"6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"}"#;
        assert!(matches!(Envelope::decode(raw), Err(DecodeError::NoKeys)));
    }

    #[test]
    fn unknown_envelope_fields_are_ignored() {
        let raw = r#"{"v":1,"type":"post.created","keys":["section:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"],"payload":{},"produced_at":"2026-01-01T00:00:00Z","producer_id":"6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb","trace":"abc"}"#;
        assert!(Envelope::decode(raw).is_ok());
    }
}
