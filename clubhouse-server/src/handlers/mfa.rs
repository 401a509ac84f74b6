//! MFA enrollment endpoints

use axum::{extract::State, response::IntoResponse, Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::CurrentUser,
    error::{Error, Result},
    state::AppState,
    users,
};

/// `POST /api/v1/users/me/mfa/enable`
///
/// Generates a secret and returns the enrollment material. TOTP stays
/// disabled until the first code verifies, so a lost QR code cannot lock
/// the account.
pub async fn enable(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    if user.totp_enabled {
        return Err(Error::Conflict("MFA is already enabled".into()));
    }

    let enrollment = state.totp().enroll(&user.username)?;
    users::repo::set_totp_secret(state.db(), user.user_id, &enrollment.encrypted_secret).await?;

    tracing::info!(user_id = %user.user_id, "MFA enrollment started");

    Ok(Json(json!({
        "secret": enrollment.secret_base32,
        "otpauth_url": enrollment.otpauth_url,
    })))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub code: String,
}

/// `POST /api/v1/users/me/mfa/verify`
///
/// A correct code flips `totp_enabled` and issues the recovery codes —
/// plaintext here, exactly once; only digests are stored.
pub async fn verify(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<VerifyRequest>,
) -> Result<impl IntoResponse> {
    let row = users::repo::find_by_id(state.db(), user.user_id)
        .await?
        .ok_or(Error::InvalidSession)?;

    let secret = row
        .totp_secret_encrypted
        .as_deref()
        .ok_or_else(|| Error::InvalidRequest("MFA enrollment has not been started".into()))?;

    if !state.totp().verify_code(secret, &row.username, &body.code)? {
        return Err(Error::InvalidCredentials);
    }

    let codes = state.totp().generate_recovery_codes();
    let digests: Vec<String> = codes
        .iter()
        .map(|code| state.totp().recovery_digest(code))
        .collect();

    users::repo::replace_recovery_codes(state.db(), user.user_id, &digests).await?;
    users::repo::enable_totp(state.db(), user.user_id).await?;

    tracing::info!(user_id = %user.user_id, "MFA enabled");

    Ok(Json(json!({ "recovery_codes": codes })))
}
