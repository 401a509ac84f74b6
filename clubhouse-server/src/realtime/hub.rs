//! Subscription hub: the per-process connection registry
//!
//! The hub owns two mutually consistent indices — routing key → subscriber
//! set (sharded by key hash) and connection → subscribed keys — plus the
//! bounded outbound queue handle of every live connection. Dispatch only
//! ever `try_send`s into those queues: a slow consumer loses frames, the
//! rest of the fan-out is untouched.

use axum::extract::ws::{close_code, CloseFrame, Message};
use dashmap::DashMap;
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::event::Envelope;
use super::keys::RoutingKey;
use super::protocol::ServerMessage;

/// Number of lock shards striping the routing-key index
const SHARD_COUNT: usize = 16;

/// Process-unique identifier for a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription failure modes surfaced to the socket layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeError {
    /// The connection is at its subscription cap
    LimitExceeded,
    /// The connection is gone (already unregistered)
    UnknownConnection,
}

struct ConnectionEntry {
    user_id: Uuid,
    sender: mpsc::Sender<Message>,
    keys: Mutex<HashSet<RoutingKey>>,
    degraded: AtomicBool,
}

/// The per-process registry mapping subscriptions to connections
pub struct Hub {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    shards: Vec<RwLock<HashMap<RoutingKey, HashSet<ConnectionId>>>>,
    max_subscriptions: usize,
}

impl Hub {
    pub fn new(max_subscriptions: usize) -> Self {
        Self {
            connections: DashMap::new(),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            max_subscriptions,
        }
    }

    fn shard(&self, key: &RoutingKey) -> &RwLock<HashMap<RoutingKey, HashSet<ConnectionId>>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Register a connection's outbound queue; returns its id
    pub fn register(&self, user_id: Uuid, sender: mpsc::Sender<Message>) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                sender,
                keys: Mutex::new(HashSet::new()),
                degraded: AtomicBool::new(false),
            },
        );
        tracing::debug!(connection_id = %id, user_id = %user_id, "connection registered");
        id
    }

    /// Remove a connection and every subscription tuple it appears in.
    ///
    /// After this returns, no dispatch can reach the connection: the entry
    /// is gone from the registry before its key memberships are cleared,
    /// and the hub's queue handle drops last.
    pub fn unregister(&self, id: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return;
        };

        let keys = entry
            .keys
            .lock()
            .map(|set| set.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();

        for key in keys {
            let mut shard = self.shard(&key).write().expect("hub shard poisoned");
            if let Some(subscribers) = shard.get_mut(&key) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    shard.remove(&key);
                }
            }
        }

        tracing::debug!(connection_id = %id, "connection unregistered");
    }

    /// Subscribe a connection to a routing key. Idempotent; capped.
    pub fn subscribe(&self, id: ConnectionId, key: RoutingKey) -> Result<(), SubscribeError> {
        let entry = self
            .connections
            .get(&id)
            .ok_or(SubscribeError::UnknownConnection)?;

        {
            let mut keys = entry.keys.lock().expect("connection key set poisoned");
            if keys.contains(&key) {
                return Ok(());
            }
            if keys.len() >= self.max_subscriptions {
                return Err(SubscribeError::LimitExceeded);
            }
            keys.insert(key);
        }
        drop(entry);

        self.shard(&key)
            .write()
            .expect("hub shard poisoned")
            .entry(key)
            .or_default()
            .insert(id);

        Ok(())
    }

    /// Remove a subscription. Idempotent; unknown connections are a no-op.
    pub fn unsubscribe(&self, id: ConnectionId, key: RoutingKey) {
        let Some(entry) = self.connections.get(&id) else {
            return;
        };

        let was_subscribed = entry
            .keys
            .lock()
            .map(|mut keys| keys.remove(&key))
            .unwrap_or(false);
        drop(entry);

        if was_subscribed {
            let mut shard = self.shard(&key).write().expect("hub shard poisoned");
            if let Some(subscribers) = shard.get_mut(&key) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    shard.remove(&key);
                }
            }
        }
    }

    /// Deliver an envelope to every connection subscribed to any of its
    /// routing keys. Returns the number of queues the frame landed in.
    ///
    /// Never blocks: a full queue drops the frame for that connection only
    /// and bumps `websocket.errors{error_type="queue_full"}`.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let mut targets: HashSet<ConnectionId> = HashSet::new();
        for key in &envelope.keys {
            let shard = self.shard(key).read().expect("hub shard poisoned");
            if let Some(subscribers) = shard.get(key) {
                targets.extend(subscribers.iter().copied());
            }
        }

        if targets.is_empty() {
            return 0;
        }

        let frame = Message::Text(ServerMessage::event(envelope).to_json().into());

        let mut delivered = 0;
        for id in targets {
            let Some(entry) = self.connections.get(&id) else {
                continue;
            };
            match entry.sender.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    counter!("websocket.errors", "error_type" => "queue_full").increment(1);
                    if !entry.degraded.swap(true, Ordering::Relaxed) {
                        tracing::warn!(connection_id = %id, "outbound queue full, connection degraded");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Connection is tearing down; unregister will reap it
                }
            }
        }

        delivered
    }

    /// Enqueue a "going away" close to every connection of one user.
    ///
    /// Used when an operator revokes all sessions: HTTP revocation is
    /// instant, and the sockets are told to go re-authenticate.
    pub fn disconnect_user(&self, user_id: Uuid) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            if entry.user_id == user_id {
                let _ = entry.sender.try_send(close_frame());
                closed += 1;
            }
        }
        closed
    }

    /// Enqueue a close to every live connection (graceful shutdown)
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for entry in self.connections.iter() {
            let _ = entry.sender.try_send(close_frame());
            closed += 1;
        }
        closed
    }

    /// Whether the connection has dropped frames recently
    pub fn is_degraded(&self, id: ConnectionId) -> bool {
        self.connections
            .get(&id)
            .map(|entry| entry.degraded.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The keys a connection currently subscribes to
    pub fn subscriptions_of(&self, id: ConnectionId) -> HashSet<RoutingKey> {
        self.connections
            .get(&id)
            .and_then(|entry| entry.keys.lock().ok().map(|keys| keys.clone()))
            .unwrap_or_default()
    }

    /// The connections currently subscribed to a key
    pub fn subscribers_of(&self, key: &RoutingKey) -> HashSet<ConnectionId> {
        self.shard(key)
            .read()
            .expect("hub shard poisoned")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::AWAY,
        reason: "going away".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::Event;
    use serde_json::json;

    fn envelope(keys: &[RoutingKey]) -> Envelope {
        let mut event = Event::post_created(Uuid::new_v4(), json!({"n": 1}));
        event.keys = keys.to_vec();
        Envelope::new(event, Uuid::new_v4())
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_bidirectional() {
        let hub = Hub::new(8);
        let (tx, _rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);
        let key = RoutingKey::Post(Uuid::new_v4());

        hub.subscribe(conn, key).unwrap();
        hub.subscribe(conn, key).unwrap();

        assert_eq!(hub.subscriptions_of(conn).len(), 1);
        assert!(hub.subscribers_of(&key).contains(&conn));
    }

    #[tokio::test]
    async fn subscription_cap_preserves_existing_subscriptions() {
        let hub = Hub::new(2);
        let (tx, _rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);

        let k1 = RoutingKey::Post(Uuid::new_v4());
        let k2 = RoutingKey::Post(Uuid::new_v4());
        let k3 = RoutingKey::Post(Uuid::new_v4());

        hub.subscribe(conn, k1).unwrap();
        hub.subscribe(conn, k2).unwrap();
        assert_eq!(hub.subscribe(conn, k3), Err(SubscribeError::LimitExceeded));

        // Prior subscriptions intact, and re-subscribing to one still works
        assert_eq!(hub.subscriptions_of(conn).len(), 2);
        hub.subscribe(conn, k1).unwrap();
    }

    #[tokio::test]
    async fn unregister_clears_both_indices() {
        let hub = Hub::new(8);
        let (tx, _rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);
        let key = RoutingKey::Section(Uuid::new_v4());

        hub.subscribe(conn, key).unwrap();
        hub.unregister(conn);

        assert_eq!(hub.connection_count(), 0);
        assert!(hub.subscribers_of(&key).is_empty());
        assert!(hub.subscriptions_of(conn).is_empty());
        assert_eq!(
            hub.subscribe(conn, key),
            Err(SubscribeError::UnknownConnection)
        );
    }

    #[tokio::test]
    async fn dispatch_reaches_only_matching_subscribers() {
        let hub = Hub::new(8);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = hub.register(Uuid::new_v4(), tx_a);
        let b = hub.register(Uuid::new_v4(), tx_b);

        let watched = RoutingKey::Post(Uuid::new_v4());
        let other = RoutingKey::Post(Uuid::new_v4());
        hub.subscribe(a, watched).unwrap();
        hub.subscribe(b, other).unwrap();

        let delivered = hub.dispatch(&envelope(&[watched]));
        assert_eq!(delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_dedupes_across_keys() {
        let hub = Hub::new(8);
        let (tx, mut rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);

        let k1 = RoutingKey::Post(Uuid::new_v4());
        let k2 = RoutingKey::User(Uuid::new_v4());
        hub.subscribe(conn, k1).unwrap();
        hub.subscribe(conn, k2).unwrap();

        // One frame even though both keys match this connection
        assert_eq!(hub.dispatch(&envelope(&[k1, k2])), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_queue_drops_frames_without_stalling_others() {
        let hub = Hub::new(8);
        let (tx_stuck, _rx_stuck) = mpsc::channel(1);
        let (tx_live, mut rx_live) = mpsc::channel(4);
        let stuck = hub.register(Uuid::new_v4(), tx_stuck);
        let live = hub.register(Uuid::new_v4(), tx_live);

        let key = RoutingKey::Post(Uuid::new_v4());
        hub.subscribe(stuck, key).unwrap();
        hub.subscribe(live, key).unwrap();

        // First dispatch fills stuck's queue of depth 1
        assert_eq!(hub.dispatch(&envelope(&[key])), 2);
        // Second only lands in live's queue; stuck is degraded, not closed
        assert_eq!(hub.dispatch(&envelope(&[key])), 1);

        assert!(hub.is_degraded(stuck));
        assert!(!hub.is_degraded(live));
        assert!(rx_live.try_recv().is_ok());
        assert!(rx_live.try_recv().is_ok());
    }

    #[tokio::test]
    async fn no_delivery_after_unregister() {
        let hub = Hub::new(8);
        let (tx, mut rx) = mpsc::channel(4);
        let conn = hub.register(Uuid::new_v4(), tx);
        let key = RoutingKey::Post(Uuid::new_v4());
        hub.subscribe(conn, key).unwrap();

        hub.unregister(conn);
        assert_eq!(hub.dispatch(&envelope(&[key])), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_user_targets_only_that_user() {
        let hub = Hub::new(8);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register(alice, tx_a);
        hub.register(bob, tx_b);

        assert_eq!(hub.disconnect_user(alice), 1);
        assert!(matches!(rx_a.try_recv(), Ok(Message::Close(_))));
        assert!(rx_b.try_recv().is_err());
    }
}
