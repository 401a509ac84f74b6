//! Registration, login, logout, CSRF, sessions, and password reset

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{AppendHeaders, IntoResponse},
    Extension, Json,
};
use deadpool_redis::redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    error::{Error, Result},
    session::{clear_session_cookie, generate_token, session_cookie},
    state::AppState,
    users::{self, UserSummary},
};

use super::client_ip;

const RESET_PREFIX: &str = "pwreset:";

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: Option<String>,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub message: String,
}

/// `POST /api/v1/auth/register`
pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    state
        .limiter()
        .check_pair("register", &body.username, &client_ip(&headers))
        .await?;

    users::validate_username(&body.username)?;
    if let Some(email) = &body.email {
        if !email.contains('@') {
            return Err(Error::InvalidRequest("invalid email address".into()));
        }
    }

    let password_hash = state.hasher().hash(&body.password)?;
    let user = users::repo::create(
        state.db(),
        &body.username,
        body.email.as_deref(),
        &password_hash,
    )
    .await?;

    tracing::info!(user_id = %user.id, "user registered, awaiting approval");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            id: user.id,
            username: user.username,
            email: user.email,
            message: "registration received; an administrator will approve your account".into(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    /// 6-digit TOTP code, when enrolled
    pub totp: Option<String>,
    /// One-time recovery code, accepted in place of `totp`
    pub recovery: Option<String>,
}

/// `POST /api/v1/auth/login`
///
/// Exempt from CSRF; throttled per username and per client IP instead.
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    state
        .limiter()
        .check_pair("login", &body.username, &client_ip(&headers))
        .await?;

    let user = users::repo::find_by_username(state.db(), &body.username)
        .await?
        .ok_or(Error::InvalidCredentials)?;

    if !state.hasher().verify(&body.password, &user.password_hash)? {
        return Err(Error::InvalidCredentials);
    }
    user.can_authenticate()?;

    if user.totp_enabled {
        verify_second_factor(&state, &user, &body).await?;
    }

    let session = state
        .sessions()
        .create(user.id, &user.username, user.is_admin)
        .await?;
    let csrf_token = state.csrf().issue(&session.id).await?;

    let session_config = &state.config().session;
    let cookie = session_cookie(
        &session_config.cookie_name,
        &session.id,
        session_config.cookie_secure,
        session_config.ttl_secs(),
    );

    tracing::info!(user_id = %user.id, "login succeeded");

    Ok((
        AppendHeaders([
            ("set-cookie", cookie),
            ("x-csrf-token", csrf_token.clone()),
        ]),
        Json(json!({
            "user": UserSummary::from(&user),
            "csrf_token": csrf_token,
            "expires_at": session.expires_at,
        })),
    ))
}

/// Second factor: a valid TOTP code, or a one-time recovery code.
///
/// Recovery redemption is a conditional update, so two racing logins with
/// the same code cannot both succeed.
async fn verify_second_factor(
    state: &AppState,
    user: &users::User,
    body: &LoginRequest,
) -> Result<()> {
    let secret = user
        .totp_secret_encrypted
        .as_deref()
        .ok_or_else(|| Error::Internal("totp enabled without a stored secret".into()))?;

    if let Some(code) = body.totp.as_deref() {
        if state.totp().verify_code(secret, &user.username, code)? {
            return Ok(());
        }
        return Err(Error::InvalidCredentials);
    }

    if let Some(recovery) = body.recovery.as_deref() {
        let digest = state.totp().recovery_digest(recovery);
        if users::repo::redeem_recovery_code(state.db(), user.id, &digest).await? {
            let remaining = users::repo::unused_recovery_codes(state.db(), user.id).await?;
            tracing::info!(user_id = %user.id, remaining, "recovery code redeemed");
            return Ok(());
        }
        return Err(Error::InvalidCredentials);
    }

    Err(Error::MfaRequired)
}

/// `POST /api/v1/auth/logout`
pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    state.sessions().delete(&user.session_id).await?;

    let session_config = &state.config().session;
    let cookie = clear_session_cookie(&session_config.cookie_name, session_config.cookie_secure);

    Ok((
        AppendHeaders([("set-cookie", cookie)]),
        Json(json!({ "message": "logged out" })),
    ))
}

/// `POST /api/v1/auth/logout-all` — revoke every session of the caller
/// and tell their live sockets to go away.
pub async fn logout_all(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    let count = state.sessions().delete_all_for_user(user.user_id).await?;
    state.hub().disconnect_user(user.user_id);

    let session_config = &state.config().session;
    let cookie = clear_session_cookie(&session_config.cookie_name, session_config.cookie_secure);

    Ok((
        AppendHeaders([("set-cookie", cookie)]),
        Json(json!({ "count": count })),
    ))
}

/// `POST /api/v1/admin/users/{id}/logout-all` — admin revocation.
///
/// The next HTTP request on any revoked session observes 401; the user's
/// sockets are closed proactively.
pub async fn admin_logout_all(
    State(state): State<AppState>,
    Extension(admin): Extension<CurrentUser>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let count = state.sessions().delete_all_for_user(user_id).await?;
    let sockets = state.hub().disconnect_user(user_id);

    tracing::info!(
        admin_user_id = %admin.user_id,
        user_id = %user_id,
        sessions = count,
        sockets,
        "admin revoked all sessions"
    );

    Ok(Json(json!({ "count": count })))
}

/// `GET /api/v1/auth/csrf` — mint a token for subsequent mutating requests
pub async fn csrf(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    let token = state.csrf().issue(&user.session_id).await?;
    Ok((
        AppendHeaders([("x-csrf-token", token.clone())]),
        Json(json!({ "token": token })),
    ))
}

/// `GET /api/v1/auth/me`
pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    let row = users::repo::find_by_id(state.db(), user.user_id)
        .await?
        .ok_or(Error::InvalidSession)?;
    Ok(Json(UserSummary::from(&row)))
}

#[derive(Debug, Serialize)]
struct SessionEntry {
    /// Truncated identifier; enough to recognize, useless to replay
    id_prefix: String,
    created_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
    current: bool,
}

/// `GET /api/v1/auth/sessions` — the caller's live sessions
pub async fn sessions(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    let sessions = state.sessions().list_for_user(user.user_id).await?;

    let entries: Vec<SessionEntry> = sessions
        .iter()
        .map(|session| SessionEntry {
            id_prefix: session.id.chars().take(8).collect(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            current: session.id == user.session_id,
        })
        .collect();

    Ok(Json(json!({ "sessions": entries })))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    /// Username or email
    pub identifier: String,
}

/// `POST /api/v1/auth/password-reset/request`
///
/// Always answers 200 so the endpoint cannot be used to enumerate
/// accounts. Token delivery (email) is outside this core.
pub async fn password_reset_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetRequest>,
) -> Result<impl IntoResponse> {
    state
        .limiter()
        .check_pair("pwreset", &body.identifier, &client_ip(&headers))
        .await?;

    let user = if body.identifier.contains('@') {
        users::repo::find_by_email(state.db(), &body.identifier).await?
    } else {
        users::repo::find_by_username(state.db(), &body.identifier).await?
    };

    if let Some(user) = user.filter(|u| u.can_authenticate().is_ok()) {
        let token = generate_token();
        let mut conn = state.redis().get().await?;
        conn.set_ex::<_, _, ()>(
            format!("{RESET_PREFIX}{token}"),
            user.id.to_string(),
            state.config().auth.reset_token_ttl_secs,
        )
        .await?;

        tracing::info!(user_id = %user.id, "password reset token issued");
    }

    Ok(Json(json!({
        "message": "if the account exists, a reset link is on its way"
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResetRedeemRequest {
    pub token: String,
    pub password: String,
}

/// `POST /api/v1/auth/password-reset/redeem`
///
/// Single-use: the token is consumed atomically (GETDEL). A successful
/// reset revokes every session of the account.
pub async fn password_reset_redeem(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ResetRedeemRequest>,
) -> Result<impl IntoResponse> {
    state
        .limiter()
        .check("pwreset-redeem-ip", &client_ip(&headers))
        .await?;

    let mut conn = state.redis().get().await?;
    let user_id: Option<String> = conn
        .get_del(format!("{RESET_PREFIX}{}", body.token))
        .await?;

    let user_id: Uuid = user_id
        .ok_or(Error::InvalidCredentials)?
        .parse()
        .map_err(|_| Error::Internal("corrupt reset token record".into()))?;

    let password_hash = state.hasher().hash(&body.password)?;
    users::repo::update_password(state.db(), user_id, &password_hash).await?;

    let revoked = state.sessions().delete_all_for_user(user_id).await?;
    state.hub().disconnect_user(user_id);

    tracing::info!(user_id = %user_id, revoked, "password reset redeemed");

    Ok(Json(json!({ "message": "password updated; please log in" })))
}
