//! Web Push subscription endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::CurrentUser,
    error::{Error, Result},
    notifications::push,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SubscribeKeys {
    pub auth: String,
    pub p256dh: String,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscribeKeys,
}

/// `POST /api/v1/push/subscribe`
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<SubscribeRequest>,
) -> Result<impl IntoResponse> {
    if !body.endpoint.starts_with("https://") {
        return Err(Error::InvalidRequest(
            "push endpoint must be an https URL".into(),
        ));
    }
    if body.keys.auth.is_empty() || body.keys.p256dh.is_empty() {
        return Err(Error::InvalidRequest("missing subscription keys".into()));
    }

    let subscription = push::upsert_subscription(
        state.db(),
        user.user_id,
        &body.endpoint,
        &body.keys.auth,
        &body.keys.p256dh,
    )
    .await?;

    tracing::debug!(user_id = %user.user_id, "push subscription registered");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": subscription.id,
            "endpoint": subscription.endpoint,
            "created_at": subscription.created_at,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

/// `DELETE /api/v1/push/subscribe` — idempotent removal
pub async fn unsubscribe(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<UnsubscribeRequest>,
) -> Result<impl IntoResponse> {
    push::remove_subscription(state.db(), user.user_id, &body.endpoint).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/v1/push/public-key` — VAPID public key for client subscribe
pub async fn public_key(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let config = &state.config().push;
    if !config.enabled() {
        return Err(Error::NotFound("push delivery is not configured".into()));
    }
    Ok(Json(json!({ "public_key": config.vapid_public_key })))
}
