//! Notification write path
//!
//! Producers hand the dispatcher `{recipient, kind, related ids}` tuples.
//! Per recipient: persist (coalescing recent duplicates), emit a
//! `notification.created` event on the recipient's routing key, and fan out
//! to the recipient's live push subscriptions. Only persistence can fail the
//! call; realtime and push are best-effort.

use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use super::{push, push::WebPushSender, repo, NotificationKind};
use crate::{
    error::Result,
    realtime::{Event, EventBus},
};

/// Longest excerpt carried in events and push payloads
const EXCERPT_MAX_CHARS: usize = 140;

/// One notification to produce
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub recipient: Uuid,
    pub kind: NotificationKind,
    pub related_post_id: Option<Uuid>,
    pub related_comment_id: Option<Uuid>,
    /// The acting user, when there is one
    pub actor_user_id: Option<Uuid>,
    pub excerpt: Option<String>,
}

/// Persists notifications and fans them out
#[derive(Clone)]
pub struct NotificationDispatcher {
    db: PgPool,
    bus: Arc<EventBus>,
    push: Option<Arc<WebPushSender>>,
}

impl NotificationDispatcher {
    pub fn new(db: PgPool, bus: Arc<EventBus>, push: Option<Arc<WebPushSender>>) -> Self {
        Self { db, bus, push }
    }

    /// Produce a batch of notifications, one row per recipient.
    ///
    /// Self-notifications (actor == recipient) are dropped silently.
    pub async fn notify(&self, batch: Vec<NotificationRequest>) -> Result<()> {
        for request in batch {
            if request.actor_user_id == Some(request.recipient) {
                continue;
            }
            self.notify_one(request).await?;
        }
        Ok(())
    }

    async fn notify_one(&self, request: NotificationRequest) -> Result<()> {
        let row = repo::create_or_coalesce(
            &self.db,
            &repo::NewNotification {
                user_id: request.recipient,
                kind: request.kind.as_str().to_string(),
                related_post_id: request.related_post_id,
                related_comment_id: request.related_comment_id,
                related_user_id: request.actor_user_id,
                content_excerpt: sanitize_excerpt(request.excerpt),
            },
        )
        .await?;

        // Sanitized payload: ids and a short excerpt, nothing else
        let payload = json!({
            "id": row.id,
            "kind": row.kind,
            "related_post_id": row.related_post_id,
            "related_comment_id": row.related_comment_id,
            "related_user_id": row.related_user_id,
            "content_excerpt": row.content_excerpt,
            "created_at": row.created_at,
        });

        if let Err(e) = self
            .bus
            .publish(Event::notification_created(request.recipient, payload.clone()))
            .await
        {
            tracing::warn!("notification event publish failed: {e}");
        }

        if let Some(sender) = &self.push {
            let sender = sender.clone();
            let db = self.db.clone();
            let recipient = request.recipient;
            let body = payload.to_string().into_bytes();

            tokio::spawn(async move {
                let subscriptions = match push::live_subscriptions(&db, recipient).await {
                    Ok(subscriptions) => subscriptions,
                    Err(e) => {
                        tracing::error!("failed to load push subscriptions: {e}");
                        return;
                    }
                };
                for subscription in subscriptions {
                    sender.deliver(&subscription, &body).await;
                }
            });
        }

        Ok(())
    }

    /// Tell the recipient's other tabs that notifications were read
    pub async fn notify_read(&self, user_id: Uuid, ids: Vec<Uuid>, unread_count: i64) {
        let payload = json!({ "ids": ids, "unread_count": unread_count });
        if let Err(e) = self
            .bus
            .publish(Event::notification_read(user_id, payload))
            .await
        {
            tracing::warn!("notification.read publish failed: {e}");
        }
    }
}

/// Truncate an excerpt to its first `EXCERPT_MAX_CHARS` characters
fn sanitize_excerpt(excerpt: Option<String>) -> Option<String> {
    excerpt.map(|text| {
        if text.chars().count() <= EXCERPT_MAX_CHARS {
            text
        } else {
            text.chars().take(EXCERPT_MAX_CHARS).collect()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_excerpts_pass_through() {
        assert_eq!(
            sanitize_excerpt(Some("hello".into())),
            Some("hello".to_string())
        );
        assert_eq!(sanitize_excerpt(None), None);
    }

    #[test]
    fn long_excerpts_are_truncated_on_char_boundaries() {
        let long = "ä".repeat(200);
        let sanitized = sanitize_excerpt(Some(long)).unwrap();
        assert_eq!(sanitized.chars().count(), EXCERPT_MAX_CHARS);
    }
}
