//! Cross-process event bus over Redis pub/sub
//!
//! Publishing dispatches to the local hub immediately, then replicates the
//! envelope on the shared channel so every other process's hub delivers it
//! too. Each process tags envelopes with its `producer_id` and ignores its
//! own echoes. A lost pub/sub frame never closes a client: the realtime
//! plane is best-effort and the persistent read model is authoritative.

use deadpool_redis::{redis::AsyncCommands, Pool};
use futures::StreamExt;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::event::{Envelope, Event};
use super::hub::Hub;
use crate::error::Result;

const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// What became of one inbound pub/sub message
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    /// Dispatched locally to this many queues
    Dispatched(usize),
    /// Our own publication echoed back; already dispatched at publish time
    OwnEcho,
    /// Dropped at the boundary
    Malformed,
}

/// Publishes envelopes and feeds inbound ones to the local hub
pub struct EventBus {
    pool: Pool,
    hub: Arc<Hub>,
    channel: String,
    redis_url: String,
    producer_id: Uuid,
}

impl EventBus {
    pub fn new(pool: Pool, hub: Arc<Hub>, redis_url: &str, channel: &str) -> Self {
        Self {
            pool,
            hub,
            channel: channel.to_string(),
            redis_url: redis_url.to_string(),
            producer_id: Uuid::new_v4(),
        }
    }

    /// This process's envelope tag
    pub fn producer_id(&self) -> Uuid {
        self.producer_id
    }

    /// Publish an event: local hub first, then the shared channel.
    ///
    /// A publish failure means remote processes miss the event; local
    /// subscribers have already been served.
    pub async fn publish(&self, event: Event) -> Result<()> {
        let envelope = Envelope::new(event, self.producer_id);
        self.hub.dispatch(&envelope);

        let payload = serde_json::to_string(&envelope)?;
        let mut conn = self.pool.get().await?;
        conn.publish::<_, _, ()>(&self.channel, payload).await?;

        Ok(())
    }

    fn handle_payload(&self, raw: &str) -> Inbound {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                counter!("eventbus.malformed").increment(1);
                tracing::warn!("dropping malformed bus message: {e}");
                return Inbound::Malformed;
            }
        };

        if envelope.producer_id == self.producer_id {
            return Inbound::OwnEcho;
        }

        Inbound::Dispatched(self.hub.dispatch(&envelope))
    }

    /// Run the subscriber loop until shutdown.
    ///
    /// Reconnects with exponential backoff on any transport failure; the
    /// process degrades rather than crashing when the channel misbehaves.
    pub async fn run_subscriber(self: Arc<Self>, shutdown: CancellationToken) {
        let mut delay = RECONNECT_DELAY_MIN;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.subscribe_and_pump(&shutdown).await {
                Ok(()) => {
                    // Clean shutdown
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        "event bus subscription lapsed: {e}; reconnecting in {delay:?}"
                    );
                }
            }

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(RECONNECT_DELAY_MAX);
        }
    }

    async fn subscribe_and_pump(&self, shutdown: &CancellationToken) -> Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        tracing::info!(channel = %self.channel, "event bus subscribed");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                message = stream.next() => {
                    let Some(message) = message else {
                        return Err(crate::error::Error::StoreUnavailable(
                            "pub/sub stream ended".into(),
                        ));
                    };
                    match message.get_payload::<String>() {
                        Ok(raw) => {
                            self.handle_payload(&raw);
                        }
                        Err(e) => {
                            counter!("eventbus.malformed").increment(1);
                            tracing::warn!("undecodable bus payload: {e}");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::keys::RoutingKey;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn bus_with_hub() -> (Arc<EventBus>, Arc<Hub>) {
        let hub = Arc::new(Hub::new(16));
        // Deadpool connects lazily; no Redis is touched by these tests
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:1")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .expect("pool config");
        let bus = Arc::new(EventBus::new(pool, hub.clone(), "redis://127.0.0.1:1", "realtime.events"));
        (bus, hub)
    }

    #[tokio::test]
    async fn inbound_envelopes_reach_local_subscribers() {
        let (bus, hub) = bus_with_hub();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);
        let post = Uuid::new_v4();
        hub.subscribe(conn, RoutingKey::Post(post)).unwrap();

        let remote = Envelope::new(
            Event::comment_created(post, json!({"post_id": post})),
            Uuid::new_v4(),
        );
        let raw = serde_json::to_string(&remote).unwrap();

        assert_eq!(bus.handle_payload(&raw), Inbound::Dispatched(1));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn own_echo_is_suppressed() {
        let (bus, hub) = bus_with_hub();
        let (tx, mut rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);
        let post = Uuid::new_v4();
        hub.subscribe(conn, RoutingKey::Post(post)).unwrap();

        let own = Envelope::new(
            Event::comment_created(post, json!({})),
            bus.producer_id(),
        );
        let raw = serde_json::to_string(&own).unwrap();

        assert_eq!(bus.handle_payload(&raw), Inbound::OwnEcho);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_not_fatal() {
        let (bus, _hub) = bus_with_hub();
        assert_eq!(bus.handle_payload("not json"), Inbound::Malformed);
        assert_eq!(
            bus.handle_payload(r#"{"v":1,"type":"post.created","keys":[],"payload":{},"produced_at":"2026-01-01T00:00:00Z","producer_id":"6d9f2d5e-63a3-4f6e-9a3f-0a35be5c58cb"}"#),
            Inbound::Malformed
        );
    }
}
