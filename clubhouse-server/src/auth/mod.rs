//! Authentication fabric: passwords, MFA, request middleware, rate limits

mod middleware;
mod password;
mod ratelimit;
mod totp;

pub use middleware::{require_admin, require_session, CurrentUser};
pub use password::PasswordHasher;
pub use ratelimit::RateLimiter;
pub use totp::{MfaEnrollment, TotpManager, RECOVERY_CODE_COUNT};
