//! Application state shared across handlers
//!
//! Everything here is constructed once at startup and injected; the only
//! process-wide mutable state in the service is inside the hub's indices
//! and the metric instruments. Startup connectivity failures are fatal.

use deadpool_redis::Pool as RedisPool;
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    auth::{PasswordHasher, RateLimiter, TotpManager},
    cache,
    config::Config,
    database,
    error::Result,
    notifications::{push::WebPushSender, NotificationDispatcher},
    realtime::{EventBus, Hub},
    session::{CsrfGuard, SessionStore},
};

struct Inner {
    config: Config,
    db: PgPool,
    redis: RedisPool,
    sessions: SessionStore,
    csrf: CsrfGuard,
    limiter: RateLimiter,
    hasher: PasswordHasher,
    totp: TotpManager,
    hub: Arc<Hub>,
    bus: Arc<EventBus>,
    dispatcher: NotificationDispatcher,
    metrics: PrometheusHandle,
}

/// Cheaply cloneable handle to all service dependencies
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

impl AppState {
    /// Connect to the stores and wire every component together.
    ///
    /// Any failure here aborts startup; the process exits non-zero rather
    /// than limping along without its session or event fabric.
    pub async fn initialize(config: Config, metrics: PrometheusHandle) -> Result<Self> {
        let db = database::create_pool(&config.database).await?;
        let redis = cache::create_pool(&config.redis).await?;

        let sessions = SessionStore::new(redis.clone(), config.session.ttl_secs());
        let csrf = CsrfGuard::new(redis.clone(), config.session.csrf_ttl_secs);
        let limiter = RateLimiter::new(
            redis.clone(),
            config.auth.rate_limit_attempts,
            config.auth.rate_limit_window_secs,
        );
        let hasher = PasswordHasher::new(config.auth.min_password_length)?;
        let totp = TotpManager::new(&config.auth.totp_issuer, &config.auth.totp_encryption_key)?;

        let hub = Arc::new(Hub::new(config.realtime.max_subscriptions_per_conn));
        let bus = Arc::new(EventBus::new(
            redis.clone(),
            hub.clone(),
            &config.redis.url,
            &config.realtime.event_channel,
        ));
        let push = WebPushSender::new(db.clone(), &config.push).map(Arc::new);
        let dispatcher = NotificationDispatcher::new(db.clone(), bus.clone(), push);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                db,
                redis,
                sessions,
                csrf,
                limiter,
                hasher,
                totp,
                hub,
                bus,
                dispatcher,
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub fn redis(&self) -> &RedisPool {
        &self.inner.redis
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn csrf(&self) -> &CsrfGuard {
        &self.inner.csrf
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn hasher(&self) -> &PasswordHasher {
        &self.inner.hasher
    }

    pub fn totp(&self) -> &TotpManager {
        &self.inner.totp
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.inner.hub.clone()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.inner.bus.clone()
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.inner.dispatcher
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.inner.metrics
    }
}
