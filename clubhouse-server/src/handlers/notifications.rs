//! Notification read-model endpoints

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    error::{Error, Result},
    notifications::{repo, Cursor},
    state::AppState,
};

const DEFAULT_PAGE: i64 = 20;
const MAX_PAGE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /api/v1/notifications` — cursor-paginated, newest first
pub async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);

    let cursor = match &query.cursor {
        Some(raw) => Some(
            Cursor::decode(raw).ok_or_else(|| Error::InvalidRequest("invalid cursor".into()))?,
        ),
        None => None,
    };

    let (notifications, has_more) = repo::list(state.db(), user.user_id, cursor, limit).await?;
    let unread_count = repo::unread_count(state.db(), user.user_id).await?;

    let next_cursor = if has_more {
        notifications.last().map(|row| Cursor::from(row).encode())
    } else {
        None
    };

    Ok(Json(json!({
        "notifications": notifications,
        "meta": {
            "unread_count": unread_count,
            "has_more": has_more,
            "cursor": next_cursor,
        }
    })))
}

/// `PATCH /api/v1/notifications/{id}` — mark one notification read.
///
/// Idempotent: `read_at` is set on the first call and never changes after.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let notification = repo::mark_read(state.db(), user.user_id, id)
        .await?
        .ok_or_else(|| Error::NotFound("no such notification".into()))?;

    let unread_count = repo::unread_count(state.db(), user.user_id).await?;
    state
        .dispatcher()
        .notify_read(user.user_id, vec![id], unread_count)
        .await;

    Ok(Json(notification))
}

/// `POST /api/v1/notifications/read` — mark everything read
pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<impl IntoResponse> {
    let count = repo::mark_all_read(state.db(), user.user_id).await?;

    if count > 0 {
        state.dispatcher().notify_read(user.user_id, vec![], 0).await;
    }

    Ok(Json(json!({ "count": count })))
}
