//! Clubhouse service core
//!
//! A small-community social service. This crate carries the parts every
//! request touches: the session and authorization fabric (Redis-backed
//! sessions, CSRF double-submit, TOTP MFA), the realtime delivery plane
//! (per-process subscription hub, cross-process event bus over Redis
//! pub/sub, the WebSocket endpoint), and notification dispatch with Web
//! Push. Domain CRUD modules (posts, comments, recipes, bookshelves)
//! produce events into this plane but live outside it.

pub mod auth;
pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod notifications;
pub mod observability;
pub mod realtime;
pub mod server;
pub mod session;
pub mod state;
pub mod users;

/// Commonly used types
pub mod prelude {
    pub use crate::auth::CurrentUser;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::notifications::{NotificationDispatcher, NotificationKind, NotificationRequest};
    pub use crate::realtime::{Event, EventBus, Hub, RoutingKey};
    pub use crate::session::{Session, SessionStore};
    pub use crate::state::AppState;
}
