//! Notification queries
//!
//! `read_at` is monotonic: it is only ever set from NULL, never cleared,
//! including by the coalescing insert.

use sqlx::PgPool;
use uuid::Uuid;

use super::{Cursor, Notification};
use crate::error::Result;

const COLUMNS: &str = "id, user_id, kind, related_post_id, related_comment_id, related_user_id, \
     content_excerpt, read_at, created_at";

/// Window inside which duplicate notifications coalesce into one row
const COALESCE_WINDOW: &str = "5 minutes";

/// Fields of a new notification row
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub user_id: Uuid,
    pub kind: String,
    pub related_post_id: Option<Uuid>,
    pub related_comment_id: Option<Uuid>,
    pub related_user_id: Option<Uuid>,
    pub content_excerpt: Option<String>,
}

/// Insert a notification, coalescing with a recent unread duplicate.
///
/// The idempotency key is `(recipient, kind, related ids, actor)`: if an
/// unread row with the same key exists inside the window, it is refreshed
/// instead of duplicated.
pub async fn create_or_coalesce(pool: &PgPool, new: &NewNotification) -> Result<Notification> {
    let update = format!(
        "UPDATE notifications SET created_at = now(), content_excerpt = $6 \
         WHERE user_id = $1 AND kind = $2 \
           AND related_post_id IS NOT DISTINCT FROM $3 \
           AND related_comment_id IS NOT DISTINCT FROM $4 \
           AND related_user_id IS NOT DISTINCT FROM $5 \
           AND read_at IS NULL \
           AND created_at > now() - interval '{COALESCE_WINDOW}' \
         RETURNING {COLUMNS}"
    );

    let coalesced = sqlx::query_as::<_, Notification>(&update)
        .bind(new.user_id)
        .bind(&new.kind)
        .bind(new.related_post_id)
        .bind(new.related_comment_id)
        .bind(new.related_user_id)
        .bind(&new.content_excerpt)
        .fetch_optional(pool)
        .await?;

    if let Some(notification) = coalesced {
        return Ok(notification);
    }

    let insert = format!(
        "INSERT INTO notifications \
         (id, user_id, kind, related_post_id, related_comment_id, related_user_id, content_excerpt) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {COLUMNS}"
    );

    Ok(sqlx::query_as::<_, Notification>(&insert)
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.kind)
        .bind(new.related_post_id)
        .bind(new.related_comment_id)
        .bind(new.related_user_id)
        .bind(&new.content_excerpt)
        .fetch_one(pool)
        .await?)
}

/// Keyset-paginated page of a user's notifications, newest first.
///
/// Fetches one row past `limit` to learn whether more remain.
pub async fn list(
    pool: &PgPool,
    user_id: Uuid,
    cursor: Option<Cursor>,
    limit: i64,
) -> Result<(Vec<Notification>, bool)> {
    let rows = match cursor {
        Some(cursor) => {
            let query = format!(
                "SELECT {COLUMNS} FROM notifications \
                 WHERE user_id = $1 AND (created_at, id) < ($2, $3) \
                 ORDER BY created_at DESC, id DESC LIMIT $4"
            );
            sqlx::query_as::<_, Notification>(&query)
                .bind(user_id)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(limit + 1)
                .fetch_all(pool)
                .await?
        }
        None => {
            let query = format!(
                "SELECT {COLUMNS} FROM notifications WHERE user_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT $2"
            );
            sqlx::query_as::<_, Notification>(&query)
                .bind(user_id)
                .bind(limit + 1)
                .fetch_all(pool)
                .await?
        }
    };

    let has_more = rows.len() as i64 > limit;
    let mut rows = rows;
    rows.truncate(limit as usize);
    Ok((rows, has_more))
}

pub async fn unread_count(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT count(*) FROM notifications WHERE user_id = $1 AND read_at IS NULL")
            .bind(user_id)
            .fetch_one(pool)
            .await?;
    Ok(count.0)
}

/// Mark one notification read. Idempotent: a second call returns the row
/// with its original `read_at` untouched. `None` means no such row for
/// this user.
pub async fn mark_read(pool: &PgPool, user_id: Uuid, id: Uuid) -> Result<Option<Notification>> {
    let update = format!(
        "UPDATE notifications SET read_at = now() \
         WHERE id = $1 AND user_id = $2 AND read_at IS NULL RETURNING {COLUMNS}"
    );

    if let Some(notification) = sqlx::query_as::<_, Notification>(&update)
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?
    {
        return Ok(Some(notification));
    }

    // Already read, or absent; return whatever exists
    let select = format!("SELECT {COLUMNS} FROM notifications WHERE id = $1 AND user_id = $2");
    Ok(sqlx::query_as::<_, Notification>(&select)
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?)
}

/// Mark every unread notification read; returns how many flipped
pub async fn mark_all_read(pool: &PgPool, user_id: Uuid) -> Result<u64> {
    let result =
        sqlx::query("UPDATE notifications SET read_at = now() WHERE user_id = $1 AND read_at IS NULL")
            .bind(user_id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}
