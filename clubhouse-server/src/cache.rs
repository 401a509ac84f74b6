//! Redis connection pool management
//!
//! The pool backs the session store, CSRF guard, rate limiter, and the
//! publish half of the event bus. The subscribe half uses its own dedicated
//! connection (see `realtime::bus`).

use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::{config::RedisConfig, error::Result};

/// Ceiling for the probe backoff, whatever the configured base delay
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Create the Redis pool and wait for the server to answer.
///
/// Deadpool hands out connections lazily, so the pool object itself is
/// built exactly once; what gets retried is a connectivity probe against
/// it. Once the retry budget is spent the error propagates and startup
/// aborts — the session fabric cannot run without the store.
pub async fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let pool = DeadpoolConfig::from_url(&config.url)
        .builder()
        .map_err(|e| crate::error::Error::Internal(format!("bad Redis pool config: {e}")))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| crate::error::Error::Internal(format!("Redis pool setup failed: {e}")))?;

    let mut wait = Duration::from_secs(config.retry_delay_secs.max(1));
    let mut probes = 0;

    loop {
        match pool.get().await {
            Ok(conn) => {
                drop(conn);
                tracing::info!(
                    pool_size = config.max_connections,
                    probes = probes + 1,
                    "Redis reachable, pool ready"
                );
                return Ok(pool);
            }
            Err(e) => {
                probes += 1;
                if probes > config.max_retries {
                    tracing::error!(probes, "Redis unreachable, giving up: {e}");
                    return Err(e.into());
                }
                tracing::warn!(probes, next_probe_in = ?wait, "Redis probe failed: {e}");
                tokio::time::sleep(wait).await;
                wait = (wait * 2).min(PROBE_BACKOFF_CAP);
            }
        }
    }
}
