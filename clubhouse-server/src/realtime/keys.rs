//! Routing keys
//!
//! A routing key identifies one stream of events: activity on a post, new
//! posts in a section, or a user's notification feed. Keys travel on the
//! wire as `post:{id}` / `section:{id}` / `user:{id}` strings.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A tagged stream identifier the hub routes events by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    /// Events about a specific post (comments, reactions)
    Post(Uuid),
    /// New posts in a section
    Section(Uuid),
    /// A user's notification stream
    User(Uuid),
}

impl RoutingKey {
    /// The key's tag as it appears on the wire
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Post(_) => "post",
            Self::Section(_) => "section",
            Self::User(_) => "user",
        }
    }

    /// The identified entity
    pub fn id(&self) -> Uuid {
        match self {
            Self::Post(id) | Self::Section(id) | Self::User(id) => *id,
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag(), self.id())
    }
}

/// Error parsing a wire string into a routing key
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid routing key: {0}")]
pub struct ParseKeyError(pub String);

impl FromStr for RoutingKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, id) = s.split_once(':').ok_or_else(|| ParseKeyError(s.into()))?;
        let id = Uuid::parse_str(id).map_err(|_| ParseKeyError(s.into()))?;

        match tag {
            "post" => Ok(Self::Post(id)),
            "section" => Ok(Self::Section(id)),
            "user" => Ok(Self::User(id)),
            _ => Err(ParseKeyError(s.into())),
        }
    }
}

impl Serialize for RoutingKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoutingKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let id = Uuid::new_v4();
        for key in [
            RoutingKey::Post(id),
            RoutingKey::Section(id),
            RoutingKey::User(id),
        ] {
            let wire = key.to_string();
            assert_eq!(wire.parse::<RoutingKey>().unwrap(), key);
        }
    }

    #[test]
    fn wire_format_is_tag_colon_uuid() {
        let id: Uuid = "6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb".parse().unwrap();
        assert_eq!(
            RoutingKey::Post(id).to_string(),
            "post:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"
        );
    }

    #[test]
    fn junk_is_rejected() {
        assert!("".parse::<RoutingKey>().is_err());
        assert!("post".parse::<RoutingKey>().is_err());
        assert!("post:not-a-uuid".parse::<RoutingKey>().is_err());
        assert!("thread:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"
            .parse::<RoutingKey>()
            .is_err());
    }

    #[test]
    fn serde_uses_the_wire_string() {
        let key = RoutingKey::User("6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb".parse().unwrap());
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"user:6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb\"");

        let parsed: RoutingKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }
}
