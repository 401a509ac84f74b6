//! Session fabric: Redis-backed sessions, cookies, and CSRF protection
//!
//! Sessions are opaque 128-bit identifiers stored in the key-value store;
//! membership there is the single source of truth. Nothing is signed and
//! nothing is derived from user identity, so revocation is a key delete
//! observed by every process within the store's consistency window.

mod cookie;
mod csrf;
mod store;

pub use cookie::{clear_session_cookie, session_cookie};
pub use csrf::{csrf_middleware, CsrfGuard, CsrfRejection};
pub use store::{Session, SessionStore};

pub(crate) use store::generate_token;
