//! CSRF protection (double-submit, bound to the session)
//!
//! A per-session token lives at `csrf:{session_id}` with its own TTL and is
//! echoed by the client in a request header on every mutating request. The
//! three failure modes are distinguished so clients can tell a stale token
//! (re-fetch and retry) from a forged or absent one.

use axum::{
    body::Body,
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use deadpool_redis::{redis::AsyncCommands, Pool};
use metrics::counter;

use super::store::generate_token;
use crate::{
    auth::CurrentUser,
    error::{Error, Result},
    state::AppState,
};

const CSRF_PREFIX: &str = "csrf:";

/// Why a CSRF check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrfRejection {
    /// No token header on the request
    Missing,
    /// Header present but does not match the stored token
    Mismatch,
    /// No stored token: either never issued or its TTL lapsed
    Expired,
}

impl CsrfRejection {
    fn reason(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Mismatch => "mismatch",
            Self::Expired => "expired",
        }
    }
}

impl From<CsrfRejection> for Error {
    fn from(rejection: CsrfRejection) -> Self {
        match rejection {
            CsrfRejection::Missing => Error::CsrfMissing,
            CsrfRejection::Mismatch => Error::CsrfMismatch,
            CsrfRejection::Expired => Error::CsrfExpired,
        }
    }
}

/// Issues and verifies per-session CSRF tokens
#[derive(Clone)]
pub struct CsrfGuard {
    pool: Pool,
    ttl_secs: u64,
}

impl CsrfGuard {
    /// Create a guard over the shared Redis pool
    pub fn new(pool: Pool, ttl_secs: u64) -> Self {
        Self { pool, ttl_secs }
    }

    fn key(session_id: &str) -> String {
        format!("{CSRF_PREFIX}{session_id}")
    }

    /// Mint a fresh token for the session, replacing any previous one
    pub async fn issue(&self, session_id: &str) -> Result<String> {
        let token = generate_token();
        let mut conn = self.pool.get().await?;
        conn.set_ex::<_, _, ()>(Self::key(session_id), &token, self.ttl_secs)
            .await?;
        Ok(token)
    }

    /// Verify the header value against the stored token.
    ///
    /// Increments `csrf.validation.failures{reason}` on every rejection.
    pub async fn verify(
        &self,
        session_id: &str,
        provided: Option<&str>,
    ) -> Result<std::result::Result<(), CsrfRejection>> {
        let mut conn = self.pool.get().await?;
        let stored: Option<String> = conn.get(Self::key(session_id)).await?;

        let outcome = evaluate(stored.as_deref(), provided);
        if let Err(rejection) = outcome {
            counter!("csrf.validation.failures", "reason" => rejection.reason()).increment(1);
            tracing::warn!(reason = rejection.reason(), "CSRF validation failed");
        }

        Ok(outcome)
    }
}

/// The double-submit decision: a missing header beats everything, an absent
/// stored token means the TTL lapsed, and only a constant-time match passes.
fn evaluate(
    stored: Option<&str>,
    provided: Option<&str>,
) -> std::result::Result<(), CsrfRejection> {
    match (stored, provided) {
        (_, None) => Err(CsrfRejection::Missing),
        (None, Some(_)) => Err(CsrfRejection::Expired),
        (Some(expected), Some(candidate)) => {
            if constant_time_compare(expected, candidate) {
                Ok(())
            } else {
                Err(CsrfRejection::Mismatch)
            }
        }
    }
}

/// Middleware enforcing CSRF on state-changing methods.
///
/// Safe methods pass through untouched, so the layer can wrap a whole
/// authenticated router. Must run inside the auth middleware: it reads the
/// session from the `CurrentUser` extension.
pub async fn csrf_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let mutating = matches!(
        *request.method(),
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    if !mutating {
        return Ok(next.run(request).await);
    }

    let user = request
        .extensions()
        .get::<CurrentUser>()
        .cloned()
        .ok_or(Error::NoSession)?;

    let provided = request
        .headers()
        .get(state.config().session.csrf_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    state
        .csrf()
        .verify(&user.session_id, provided.as_deref())
        .await?
        .map_err(Error::from)?;

    Ok(next.run(request).await)
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_is_exact() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
        assert!(!constant_time_compare("", "a"));
        assert!(constant_time_compare("", ""));
    }

    #[test]
    fn rejection_reasons_are_distinct() {
        assert_eq!(CsrfRejection::Missing.reason(), "missing");
        assert_eq!(CsrfRejection::Mismatch.reason(), "mismatch");
        assert_eq!(CsrfRejection::Expired.reason(), "expired");
    }

    #[test]
    fn rejections_map_to_distinct_codes() {
        assert_eq!(Error::from(CsrfRejection::Missing).code(), "CSRF_MISSING");
        assert_eq!(Error::from(CsrfRejection::Mismatch).code(), "CSRF_MISMATCH");
        assert_eq!(Error::from(CsrfRejection::Expired).code(), "CSRF_EXPIRED");
    }

    #[test]
    fn expired_token_is_not_a_mismatch() {
        // No header at all always reads as missing
        assert_eq!(evaluate(None, None), Err(CsrfRejection::Missing));
        assert_eq!(evaluate(Some("tok"), None), Err(CsrfRejection::Missing));

        // Header present but the stored token's TTL lapsed
        assert_eq!(evaluate(None, Some("tok")), Err(CsrfRejection::Expired));

        // Both present: only an exact match passes
        assert_eq!(evaluate(Some("tok"), Some("tok")), Ok(()));
        assert_eq!(
            evaluate(Some("tok"), Some("other")),
            Err(CsrfRejection::Mismatch)
        );
    }
}
