//! Request authentication middleware
//!
//! Every authenticated route runs `require_session`; admin routes stack
//! `require_admin` on top. CSRF is deliberately a separate layer
//! (`session::csrf_middleware`) so it composes onto mutating routes only.

use axum::{
    body::Body,
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    state::AppState,
    users,
};

/// Identity attached to the request once the session checks out
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: Uuid,
    pub username: String,
    pub is_admin: bool,
    pub totp_enabled: bool,
    pub session_id: String,
}

/// Paths reachable while MFA enrollment is still pending under a
/// `mfa_required` policy. Everything else redirects into enrollment.
const MFA_EXEMPT_PATHS: &[&str] = &[
    "/api/v1/users/me/mfa/enable",
    "/api/v1/users/me/mfa/verify",
    "/api/v1/auth/logout",
    "/api/v1/auth/logout-all",
    "/api/v1/auth/csrf",
    "/api/v1/auth/me",
];

/// Authenticate the request from its session cookie.
///
/// 1. Missing cookie → 401 `NO_SESSION`
/// 2. Unknown/expired session → 401 `INVALID_SESSION`
/// 3. Suspended or deleted owner → session revoked, 401 `INVALID_SESSION`
/// 4. `CurrentUser` attached to request extensions
/// 5. MFA policy enforced when enabled
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let cookie_name = state.config().session.cookie_name.clone();
    let session_id =
        extract_cookie(&request, &cookie_name).ok_or(Error::NoSession)?;

    // Fail closed: a store outage means nobody is authenticated
    let session = match state.sessions().get(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return Err(Error::InvalidSession),
        Err(e) => {
            tracing::error!("session store unavailable: {e}");
            return Err(Error::InvalidSession);
        }
    };

    // The session snapshot can outlive moderation actions; check the row.
    let user = users::repo::find_by_id(state.db(), session.user_id)
        .await?
        .ok_or(Error::InvalidSession)?;

    if user.suspended_at.is_some() || user.deleted_at.is_some() {
        tracing::warn!(user_id = %user.id, "revoking session of inactive account");
        state.sessions().delete(&session_id).await?;
        return Err(Error::InvalidSession);
    }

    if state.config().auth.mfa_required
        && !user.totp_enabled
        && !MFA_EXEMPT_PATHS.contains(&request.uri().path())
    {
        return Err(Error::MfaRequired);
    }

    let current = CurrentUser {
        user_id: user.id,
        username: user.username.clone(),
        is_admin: user.is_admin,
        totp_enabled: user.totp_enabled,
        session_id,
    };
    request.extensions_mut().insert(current);

    Ok(next.run(request).await)
}

/// Reject non-administrators with 403 `ADMIN_REQUIRED`.
///
/// Must run inside `require_session`.
pub async fn require_admin(request: Request<Body>, next: Next) -> Result<Response> {
    let user = request
        .extensions()
        .get::<CurrentUser>()
        .ok_or(Error::NoSession)?;

    if !user.is_admin {
        tracing::warn!(user_id = %user.user_id, "admin route denied");
        return Err(Error::AdminRequired);
    }

    Ok(next.run(request).await)
}

/// Pull a named cookie out of the request's Cookie headers
fn extract_cookie(request: &Request<Body>, name: &str) -> Option<String> {
    request
        .headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(cookie::Cookie::split_parse)
        .filter_map(|parsed| parsed.ok())
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn request_with_cookie(value: &str) -> Request<Body> {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert(header::COOKIE, HeaderValue::from_str(value).unwrap());
        request
    }

    #[test]
    fn finds_session_cookie_among_others() {
        let request = request_with_cookie("theme=dark; session_id=tok123; lang=en");
        assert_eq!(
            extract_cookie(&request, "session_id"),
            Some("tok123".to_string())
        );
    }

    #[test]
    fn absent_cookie_is_none() {
        let request = request_with_cookie("theme=dark");
        assert_eq!(extract_cookie(&request, "session_id"), None);

        let bare = Request::new(Body::empty());
        assert_eq!(extract_cookie(&bare, "session_id"), None);
    }

    #[test]
    fn mfa_exemptions_cover_enrollment_and_logout() {
        assert!(MFA_EXEMPT_PATHS.contains(&"/api/v1/users/me/mfa/verify"));
        assert!(MFA_EXEMPT_PATHS.contains(&"/api/v1/auth/logout"));
        assert!(!MFA_EXEMPT_PATHS.contains(&"/api/v1/notifications"));
    }
}
