//! Liveness and metrics endpoints

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use deadpool_redis::redis::AsyncCommands;
use serde_json::json;
use std::time::Duration;

use crate::state::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /healthz` — check the stores the request path depends on
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let database_up = tokio::time::timeout(
        PROBE_TIMEOUT,
        sqlx::query("SELECT 1").execute(state.db()),
    )
    .await
    .map(|result| result.is_ok())
    .unwrap_or(false);

    let redis_up = tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut conn = state.redis().get().await?;
        conn.ping::<String>().await?;
        Ok::<_, crate::error::Error>(())
    })
    .await
    .map(|result| result.is_ok())
    .unwrap_or(false);

    let healthy = database_up && redis_up;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "database": if database_up { "up" } else { "down" },
        "redis": if redis_up { "up" } else { "down" },
    }));

    (status, body)
}

/// `GET /metrics` — Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics().render()
}
