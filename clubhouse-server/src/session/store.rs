//! Redis-backed session store
//!
//! Keys:
//! - `session:{id}` — JSON session record, TTL = session lifetime
//! - `sessions_of:{user_id}` — set of the user's live session ids, used by
//!   logout-all and session listing
//!
//! The store fails closed: any transport error surfaces as
//! `Error::StoreUnavailable` and the request is treated as unauthenticated
//! upstream.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::{redis::AsyncCommands, Pool};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

const SESSION_PREFIX: &str = "session:";
const OWNER_SET_PREFIX: &str = "sessions_of:";

/// A live session as stored in the key-value store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Opaque session identifier (128-bit CSPRNG, URL-safe base64)
    pub id: String,

    /// Owning user
    pub user_id: Uuid,

    /// Username snapshot at login time
    pub username: String,

    /// Admin flag snapshot at login time
    pub is_admin: bool,

    /// When the session was issued
    pub created_at: DateTime<Utc>,

    /// Fixed expiry; sessions are never refreshed on access
    pub expires_at: DateTime<Utc>,
}

/// Generate an unguessable 128-bit token, URL-safe base64 encoded.
///
/// Used for session ids, CSRF tokens, and password-reset tokens. Never
/// derived from user data.
pub(crate) fn generate_token() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Session issuance, validation, and revocation against Redis
#[derive(Clone)]
pub struct SessionStore {
    pool: Pool,
    ttl_secs: u64,
}

impl SessionStore {
    /// Create a store over the shared Redis pool
    pub fn new(pool: Pool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    fn session_key(id: &str) -> String {
        format!("{SESSION_PREFIX}{id}")
    }

    fn owner_key(user_id: Uuid) -> String {
        format!("{OWNER_SET_PREFIX}{user_id}")
    }

    /// Issue a session for the given user.
    ///
    /// Writes the record with a TTL matching its `expires_at` and indexes it
    /// in the owner's set. On failure no cookie must be set by the caller.
    pub async fn create(&self, user_id: Uuid, username: &str, is_admin: bool) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: generate_token(),
            user_id,
            username: username.to_string(),
            is_admin,
            created_at: now,
            expires_at: now + Duration::seconds(self.ttl_secs as i64),
        };

        let payload = serde_json::to_string(&session)?;
        let mut conn = self.pool.get().await?;

        conn.set_ex::<_, _, ()>(Self::session_key(&session.id), payload, self.ttl_secs)
            .await?;
        conn.sadd::<_, _, ()>(Self::owner_key(user_id), &session.id)
            .await?;
        // Keep the index from outliving every session it could contain
        conn.expire::<_, ()>(Self::owner_key(user_id), self.ttl_secs as i64)
            .await?;

        tracing::debug!(user_id = %user_id, "session issued");
        Ok(session)
    }

    /// Look up a session by id. Expired or unknown ids yield `None`.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let mut conn = self.pool.get().await?;
        let payload: Option<String> = conn.get(Self::session_key(id)).await?;

        match payload {
            Some(json) => {
                let session: Session = serde_json::from_str(&json)
                    .map_err(|e| Error::Internal(format!("corrupt session record: {e}")))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Delete a session. Idempotent.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;

        // Read the record first so the owner index stays consistent
        if let Some(session) = self.get(id).await? {
            conn.srem::<_, _, ()>(Self::owner_key(session.user_id), id)
                .await?;
        }
        conn.del::<_, ()>(Self::session_key(id)).await?;

        Ok(())
    }

    /// Delete every session belonging to a user. Returns the count removed.
    pub async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = conn.smembers(Self::owner_key(user_id)).await?;

        let mut removed = 0;
        for id in &ids {
            let deleted: i64 = conn.del(Self::session_key(id)).await?;
            removed += deleted as u64;
        }
        conn.del::<_, ()>(Self::owner_key(user_id)).await?;

        tracing::info!(user_id = %user_id, count = removed, "all sessions revoked");
        Ok(removed)
    }

    /// List a user's live sessions, pruning ids whose records have expired
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let mut conn = self.pool.get().await?;
        let ids: Vec<String> = conn.smembers(Self::owner_key(user_id)).await?;

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await? {
                Some(session) => sessions.push(session),
                None => {
                    // Record expired out from under the index
                    conn.srem::<_, _, ()>(Self::owner_key(user_id), &id).await?;
                }
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_128_bit_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        // 16 bytes -> 22 base64 chars without padding
        assert_eq!(a.len(), 22);
        assert!(URL_SAFE_NO_PAD.decode(&a).is_ok());
    }

    #[test]
    fn key_namespaces_do_not_collide() {
        let user = Uuid::new_v4();
        let sid = generate_token();
        assert!(SessionStore::session_key(&sid).starts_with("session:"));
        assert!(SessionStore::owner_key(user).starts_with("sessions_of:"));
        assert_ne!(SessionStore::session_key(&sid), SessionStore::owner_key(user));
    }

    #[test]
    fn session_record_round_trips() {
        let now = Utc::now();
        let session = Session {
            id: generate_token(),
            user_id: Uuid::new_v4(),
            username: "frida".into(),
            is_admin: false,
            created_at: now,
            expires_at: now + Duration::days(30),
        };

        let json = serde_json::to_string(&session).unwrap();
        let parsed: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, session.id);
        assert_eq!(parsed.user_id, session.user_id);
        assert_eq!(parsed.expires_at, session.expires_at);
    }
}
