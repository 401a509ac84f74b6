//! Notification dispatch: persistent read model, realtime fan-out, Web Push
//!
//! Realtime and push delivery are best-effort; the notification table is
//! the source of truth clients re-fetch after any reconnect.

pub mod dispatcher;
pub mod push;
pub mod repo;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use dispatcher::{NotificationDispatcher, NotificationRequest};

/// What a notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Mention,
    Reply,
    Reaction,
    Follow,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mention => "mention",
            Self::Reply => "reply",
            Self::Reaction => "reaction",
            Self::Follow => "follow",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mention" => Ok(Self::Mention),
            "reply" => Ok(Self::Reply),
            "reaction" => Ok(Self::Reaction),
            "follow" => Ok(Self::Follow),
            _ => Err(()),
        }
    }
}

/// A persisted notification row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub related_post_id: Option<Uuid>,
    pub related_comment_id: Option<Uuid>,
    /// The actor, nullable by design
    pub related_user_id: Option<Uuid>,
    pub content_excerpt: Option<String>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Opaque keyset cursor over `(created_at, id)` descending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!(
            "{}:{}",
            self.created_at.timestamp_micros(),
            self.id
        ))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let (micros, id) = text.split_once(':')?;

        Some(Self {
            created_at: Utc.timestamp_micros(micros.parse().ok()?).single()?,
            id: id.parse().ok()?,
        })
    }
}

impl From<&Notification> for Cursor {
    fn from(notification: &Notification) -> Self {
        Self {
            created_at: notification.created_at,
            id: notification.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            NotificationKind::Mention,
            NotificationKind::Reply,
            NotificationKind::Reaction,
            NotificationKind::Follow,
        ] {
            assert_eq!(kind.as_str().parse::<NotificationKind>().unwrap(), kind);
        }
        assert!("poke".parse::<NotificationKind>().is_err());
    }

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            created_at: Utc.timestamp_micros(1_750_000_000_123_456).single().unwrap(),
            id: Uuid::new_v4(),
        };
        assert_eq!(Cursor::decode(&cursor.encode()), Some(cursor));
    }

    #[test]
    fn garbage_cursors_are_rejected() {
        assert!(Cursor::decode("").is_none());
        assert!(Cursor::decode("@@@").is_none());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("no-colon")).is_none());
        assert!(Cursor::decode(&URL_SAFE_NO_PAD.encode("123:not-a-uuid")).is_none());
    }
}
