//! User accounts as the auth fabric sees them
//!
//! Domain CRUD around users (profiles, follows, watchlists) lives elsewhere;
//! this module carries only what sessions, login, and MFA need.

pub mod repo;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Username constraints: 3–50 chars of `[A-Za-z0-9_]`, case-sensitive
pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 50;

/// A user row, restricted to the columns the core reads or writes
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub password_hash: String,
    pub is_admin: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub totp_secret_encrypted: Option<String>,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// A user can authenticate only when approved, not suspended, and not
    /// deleted. Returns the specific rejection otherwise.
    pub fn can_authenticate(&self) -> Result<()> {
        if self.deleted_at.is_some() {
            // Deleted accounts are indistinguishable from wrong credentials
            return Err(Error::InvalidCredentials);
        }
        if self.suspended_at.is_some() {
            return Err(Error::UserSuspended);
        }
        if self.approved_at.is_none() {
            return Err(Error::UserNotApproved);
        }
        Ok(())
    }
}

/// Public summary returned by `/auth/me` and login
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub is_admin: bool,
    pub totp_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            is_admin: user.is_admin,
            totp_enabled: user.totp_enabled,
            created_at: user.created_at,
        }
    }
}

/// Validate a username against the registration constraints
pub fn validate_username(username: &str) -> Result<()> {
    if username.len() < USERNAME_MIN_LEN || username.len() > USERNAME_MAX_LEN {
        return Err(Error::InvalidRequest(format!(
            "username must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(Error::InvalidRequest(
            "username may only contain letters, digits, and underscores".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "marta".into(),
            email: None,
            password_hash: "$argon2id$stub".into(),
            is_admin: false,
            approved_at: Some(Utc::now()),
            suspended_at: None,
            deleted_at: None,
            totp_secret_encrypted: None,
            totp_enabled: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn approved_user_authenticates() {
        assert!(user().can_authenticate().is_ok());
    }

    #[test]
    fn pending_user_is_rejected_with_specific_code() {
        let mut u = user();
        u.approved_at = None;
        assert_eq!(u.can_authenticate().unwrap_err().code(), "USER_NOT_APPROVED");
    }

    #[test]
    fn suspended_user_is_rejected() {
        let mut u = user();
        u.suspended_at = Some(Utc::now());
        assert_eq!(u.can_authenticate().unwrap_err().code(), "USER_SUSPENDED");
    }

    #[test]
    fn deleted_user_looks_like_bad_credentials() {
        let mut u = user();
        u.deleted_at = Some(Utc::now());
        assert_eq!(
            u.can_authenticate().unwrap_err().code(),
            "INVALID_CREDENTIALS"
        );
    }

    #[test]
    fn username_rules() {
        assert!(validate_username("ana_1").is_ok());
        assert!(validate_username("ab").is_err());
        assert!(validate_username(&"x".repeat(51)).is_err());
        assert!(validate_username("has space").is_err());
        assert!(validate_username("tilde~").is_err());
    }
}
