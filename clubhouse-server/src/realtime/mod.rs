//! Realtime delivery plane
//!
//! Producers hand typed events to the [`bus::EventBus`]; every process's
//! [`hub::Hub`] delivers them to the connections subscribed to the events'
//! routing keys; [`socket`] speaks the wire protocol with clients. Delivery
//! is best-effort: frames are dropped under backpressure and clients
//! re-fetch authoritative state over HTTP after a reconnect.

pub mod bus;
pub mod event;
pub mod hub;
pub mod keys;
pub mod protocol;
pub mod socket;

pub use bus::EventBus;
pub use event::{Envelope, Event, EventType};
pub use hub::{ConnectionId, Hub, SubscribeError};
pub use keys::RoutingKey;
pub use socket::ws_handler;
