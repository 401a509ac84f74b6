//! Error types and HTTP response conversion
//!
//! Every error that can cross the HTTP boundary carries a machine code from
//! the service's enumerated set. The JSON envelope is
//! `{"error": <human message>, "code": <machine code>}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using the service error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the service
#[derive(Debug, Error)]
pub enum Error {
    /// No session cookie on the request
    #[error("no session")]
    NoSession,

    /// Session cookie present but unknown, expired, or revoked
    #[error("invalid session")]
    InvalidSession,

    /// Authenticated but not an administrator
    #[error("administrator access required")]
    AdminRequired,

    /// Mutating request without a CSRF header
    #[error("CSRF token missing")]
    CsrfMissing,

    /// CSRF header does not match the stored token
    #[error("CSRF token mismatch")]
    CsrfMismatch,

    /// Stored CSRF token expired before verification
    #[error("CSRF token expired")]
    CsrfExpired,

    /// MFA enrollment required by policy before proceeding
    #[error("multi-factor enrollment required")]
    MfaRequired,

    /// Bad username/password/TOTP/recovery combination
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Account exists but has not been approved yet
    #[error("account pending approval")]
    UserNotApproved,

    /// Account exists but is suspended
    #[error("account suspended")]
    UserSuspended,

    /// Too many requests for a rate-limited operation
    #[error("rate limit exceeded")]
    RateLimited,

    /// Connection attempted to exceed its subscription cap
    #[error("subscription limit reached")]
    SubscriptionLimit,

    /// Authenticated but not allowed to touch the resource
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource conflict (duplicate registration, already-used code, ...)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Malformed or semantically invalid client input
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The session/CSRF key-value store could not be reached.
    ///
    /// Requests that depend on it fail closed.
    #[error("key-value store unavailable: {0}")]
    StoreUnavailable(String),

    /// Relational store error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else that should surface as a 500
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine code for the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoSession => "NO_SESSION",
            Self::InvalidSession => "INVALID_SESSION",
            Self::AdminRequired => "ADMIN_REQUIRED",
            Self::CsrfMissing => "CSRF_MISSING",
            Self::CsrfMismatch => "CSRF_MISMATCH",
            Self::CsrfExpired => "CSRF_EXPIRED",
            Self::MfaRequired => "MFA_REQUIRED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::UserNotApproved => "USER_NOT_APPROVED",
            Self::UserSuspended => "USER_SUSPENDED",
            Self::RateLimited => "RATE_LIMIT",
            Self::SubscriptionLimit => "SUBSCRIPTION_LIMIT",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::StoreUnavailable(_)
            | Self::Database(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoSession
            | Self::InvalidSession
            | Self::InvalidCredentials
            | Self::UserNotApproved
            | Self::UserSuspended => StatusCode::UNAUTHORIZED,
            Self::AdminRequired
            | Self::CsrfMissing
            | Self::CsrfMismatch
            | Self::CsrfExpired
            | Self::MfaRequired
            | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::SubscriptionLimit | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::StoreUnavailable(_)
            | Self::Database(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the cause is transient (store outage, pool exhaustion)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::Database(sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_))
        )
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message
    pub error: String,

    /// Machine code from the enumerated set
    pub code: String,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        // Internal detail never reaches the client; the envelope carries a
        // generic message for 500s.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = code, status = status.as_u16(), "request failed: {self}");
            "internal server error".to_string()
        } else {
            tracing::debug!(code = code, status = status.as_u16(), "request rejected");
            self.to_string()
        };

        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_statuses() {
        assert_eq!(Error::NoSession.code(), "NO_SESSION");
        assert_eq!(Error::NoSession.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(Error::CsrfExpired.code(), "CSRF_EXPIRED");
        assert_eq!(Error::CsrfExpired.status(), StatusCode::FORBIDDEN);

        assert_eq!(Error::RateLimited.code(), "RATE_LIMIT");
        assert_eq!(Error::RateLimited.status(), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(
            Error::SubscriptionLimit.code(),
            "SUBSCRIPTION_LIMIT"
        );
    }

    #[test]
    fn store_outage_is_internal_and_transient() {
        let err = Error::StoreUnavailable("connection refused".into());
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.is_transient());
    }

    #[test]
    fn conflict_keeps_its_message() {
        let err = Error::Conflict("username taken".into());
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(err.to_string(), "conflict: username taken");
    }
}
