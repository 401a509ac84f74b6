//! Fixed-window rate limiting for credential endpoints
//!
//! Login, registration, and password-reset redemption are exempt from CSRF
//! and instead throttled per identifier and per client IP. Counters live in
//! Redis so the window is shared across processes.

use deadpool_redis::{redis::AsyncCommands, Pool};

use crate::error::{Error, Result};

const KEY_PREFIX: &str = "ratelimit:";

/// Redis-backed fixed-window limiter
#[derive(Clone)]
pub struct RateLimiter {
    pool: Pool,
    attempts: u32,
    window_secs: u64,
}

impl RateLimiter {
    /// Create a limiter allowing `attempts` hits per `window_secs` window
    pub fn new(pool: Pool, attempts: u32, window_secs: u64) -> Self {
        Self {
            pool,
            attempts,
            window_secs,
        }
    }

    fn key(scope: &str, identifier: &str) -> String {
        format!("{KEY_PREFIX}{scope}:{identifier}")
    }

    /// Record a hit for `identifier` under `scope`; errors with `RATE_LIMIT`
    /// once the window's budget is spent.
    pub async fn check(&self, scope: &str, identifier: &str) -> Result<()> {
        let key = Self::key(scope, identifier);
        let mut conn = self.pool.get().await?;

        let count: i64 = conn.incr(&key, 1).await?;
        if count == 1 {
            conn.expire::<_, ()>(&key, self.window_secs as i64).await?;
        }

        if count > i64::from(self.attempts) {
            tracing::warn!(scope = scope, "rate limit exceeded");
            return Err(Error::RateLimited);
        }

        Ok(())
    }

    /// Throttle on both the account identifier and the client IP
    pub async fn check_pair(&self, scope: &str, identifier: &str, ip: &str) -> Result<()> {
        self.check(scope, identifier).await?;
        self.check(&format!("{scope}-ip"), ip).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped() {
        assert_eq!(
            RateLimiter::key("login", "marta"),
            "ratelimit:login:marta"
        );
        assert_ne!(
            RateLimiter::key("login", "marta"),
            RateLimiter::key("login-ip", "marta")
        );
    }
}
