//! Web Push submission and subscription lifecycle
//!
//! Payloads are encrypted per the Web Push protocol with the subscription's
//! keys and signed with the service's VAPID key. Delivery is best-effort:
//! one jittered retry on transient gateway failures, and a `410`/`404`
//! response retires the subscription.

use rand::Rng;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;
use web_push::{
    ContentEncoding, HyperWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessage, WebPushMessageBuilder,
};

use crate::{
    config::PushConfig,
    error::{Error, Result},
};

const PUSH_TTL_SECS: u32 = 24 * 60 * 60;

/// A stored push subscription
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushSubscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub endpoint: String,
    pub auth_key: String,
    pub p256dh_key: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

const COLUMNS: &str = "id, user_id, endpoint, auth_key, p256dh_key, created_at, deleted_at";

/// Register (or revive) a subscription. At most one live row per endpoint:
/// re-subscribing an endpoint reassigns it and clears `deleted_at`.
pub async fn upsert_subscription(
    pool: &PgPool,
    user_id: Uuid,
    endpoint: &str,
    auth_key: &str,
    p256dh_key: &str,
) -> Result<PushSubscription> {
    let query = format!(
        "INSERT INTO push_subscriptions (id, user_id, endpoint, auth_key, p256dh_key) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (endpoint) DO UPDATE \
         SET user_id = EXCLUDED.user_id, auth_key = EXCLUDED.auth_key, \
             p256dh_key = EXCLUDED.p256dh_key, deleted_at = NULL \
         RETURNING {COLUMNS}"
    );

    Ok(sqlx::query_as::<_, PushSubscription>(&query)
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(endpoint)
        .bind(auth_key)
        .bind(p256dh_key)
        .fetch_one(pool)
        .await?)
}

/// Soft-delete a user's subscription by endpoint; true when a row changed
pub async fn remove_subscription(pool: &PgPool, user_id: Uuid, endpoint: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE push_subscriptions SET deleted_at = now() \
         WHERE user_id = $1 AND endpoint = $2 AND deleted_at IS NULL",
    )
    .bind(user_id)
    .bind(endpoint)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// The user's live subscriptions, i.e. dispatch targets
pub async fn live_subscriptions(pool: &PgPool, user_id: Uuid) -> Result<Vec<PushSubscription>> {
    let query = format!(
        "SELECT {COLUMNS} FROM push_subscriptions WHERE user_id = $1 AND deleted_at IS NULL"
    );
    Ok(sqlx::query_as::<_, PushSubscription>(&query)
        .bind(user_id)
        .fetch_all(pool)
        .await?)
}

/// Retire a stale endpoint after the gateway reported it gone
pub async fn mark_endpoint_gone(pool: &PgPool, endpoint: &str) -> Result<()> {
    sqlx::query(
        "UPDATE push_subscriptions SET deleted_at = now() \
         WHERE endpoint = $1 AND deleted_at IS NULL",
    )
    .bind(endpoint)
    .execute(pool)
    .await?;
    Ok(())
}

/// How a failed submission should be handled
#[derive(Debug, PartialEq, Eq)]
enum Failure {
    /// Endpoint is gone; retire the subscription
    Stale,
    /// Gateway hiccup; one retry is worth it
    Retryable,
    /// Anything else; give up quietly
    Permanent,
}

fn classify(error: &WebPushError) -> Failure {
    match error {
        WebPushError::EndpointNotValid | WebPushError::EndpointNotFound => Failure::Stale,
        WebPushError::ServerError { .. } | WebPushError::Other(_) => Failure::Retryable,
        _ => Failure::Permanent,
    }
}

/// Submits encrypted payloads to the Web Push gateway
pub struct WebPushSender {
    client: HyperWebPushClient,
    db: PgPool,
    vapid_private_key: String,
    vapid_subject: String,
}

impl WebPushSender {
    /// Build a sender when a VAPID key is configured
    pub fn new(db: PgPool, config: &PushConfig) -> Option<Self> {
        if !config.enabled() {
            tracing::info!("no VAPID key configured; Web Push delivery disabled");
            return None;
        }

        Some(Self {
            client: HyperWebPushClient::new(),
            db,
            vapid_private_key: config.vapid_private_key.clone(),
            vapid_subject: config.vapid_subject.clone(),
        })
    }

    fn build_message(
        &self,
        subscription: &SubscriptionInfo,
        payload: &[u8],
    ) -> Result<WebPushMessage> {
        let mut signature = VapidSignatureBuilder::from_base64(
            &self.vapid_private_key,
            web_push::URL_SAFE_NO_PAD,
            subscription,
        )
        .map_err(|e| Error::Internal(format!("VAPID signature failed: {e}")))?;
        signature.add_claim("sub", self.vapid_subject.as_str());
        let signature = signature
            .build()
            .map_err(|e| Error::Internal(format!("VAPID signing failed: {e}")))?;

        let mut builder = WebPushMessageBuilder::new(subscription);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature);
        builder.set_ttl(PUSH_TTL_SECS);

        builder
            .build()
            .map_err(|e| Error::Internal(format!("push message build failed: {e}")))
    }

    /// Deliver one payload to one subscription.
    ///
    /// Retries transient gateway failures exactly once after a jittered
    /// 500 ms ± 250 ms pause; there is no persistent retry queue.
    pub async fn deliver(&self, subscription: &PushSubscription, payload: &[u8]) {
        let info = SubscriptionInfo::new(
            subscription.endpoint.clone(),
            subscription.p256dh_key.clone(),
            subscription.auth_key.clone(),
        );

        let first = match self.build_message(&info, payload) {
            Ok(message) => self.client.send(message).await,
            Err(e) => {
                tracing::error!("push message construction failed: {e}");
                metrics::counter!("notifications.delivery_failed", "channel" => "push").increment(1);
                return;
            }
        };

        let error = match first {
            Ok(()) => {
                metrics::counter!("notifications.delivered", "channel" => "push").increment(1);
                return;
            }
            Err(error) => error,
        };

        match classify(&error) {
            Failure::Stale => {
                tracing::info!(endpoint = %subscription.endpoint, "push subscription gone, retiring");
                if let Err(e) = mark_endpoint_gone(&self.db, &subscription.endpoint).await {
                    tracing::error!("failed to retire push subscription: {e}");
                }
                metrics::counter!("notifications.delivery_failed", "channel" => "push").increment(1);
            }
            Failure::Permanent => {
                tracing::warn!(endpoint = %subscription.endpoint, "push delivery failed: {error}");
                metrics::counter!("notifications.delivery_failed", "channel" => "push").increment(1);
            }
            Failure::Retryable => {
                let jitter_millis = 250 + rand::rng().random_range(0..=500);
                tokio::time::sleep(Duration::from_millis(jitter_millis)).await;

                let retry = match self.build_message(&info, payload) {
                    Ok(message) => self.client.send(message).await,
                    Err(_) => Err(WebPushError::Unspecified),
                };

                match retry {
                    Ok(()) => {
                        metrics::counter!("notifications.delivered", "channel" => "push")
                            .increment(1);
                    }
                    Err(retry_error) => {
                        tracing::warn!(
                            endpoint = %subscription.endpoint,
                            "push delivery failed after retry: {retry_error}"
                        );
                        if classify(&retry_error) == Failure::Stale {
                            let _ = mark_endpoint_gone(&self.db, &subscription.endpoint).await;
                        }
                        metrics::counter!("notifications.delivery_failed", "channel" => "push")
                            .increment(1);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_do_not_retry() {
        assert_eq!(classify(&WebPushError::PayloadTooLarge), Failure::Permanent);
        assert_eq!(classify(&WebPushError::InvalidUri), Failure::Permanent);
        assert_eq!(classify(&WebPushError::Unspecified), Failure::Permanent);
    }

    #[test]
    fn push_ttl_is_a_day() {
        assert_eq!(PUSH_TTL_SECS, 86_400);
    }
}
