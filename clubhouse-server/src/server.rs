//! HTTP server: router assembly and graceful shutdown

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, patch, post},
    Router,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    set_header::SetResponseHeaderLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{auth, error::Result, handlers, realtime, session, state::AppState};

/// How long to wait for connections to drain after the shutdown signal
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Assemble the full application router.
///
/// Three tiers: public endpoints (credential endpoints carry their own
/// rate limits instead of CSRF), authenticated endpoints behind the session
/// middleware with the CSRF layer on mutating methods, and admin endpoints
/// with the admin gate stacked on top.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/v1/auth/register", post(handlers::auth::register))
        .route("/api/v1/auth/login", post(handlers::auth::login))
        .route(
            "/api/v1/auth/password-reset/request",
            post(handlers::auth::password_reset_request),
        )
        .route(
            "/api/v1/auth/password-reset/redeem",
            post(handlers::auth::password_reset_redeem),
        )
        .route("/healthz", get(handlers::health::healthz))
        .route("/metrics", get(handlers::health::metrics));

    let admin = Router::new()
        .route(
            "/api/v1/admin/users/{id}/logout-all",
            post(handlers::auth::admin_logout_all),
        )
        .route_layer(middleware::from_fn(auth::require_admin));

    let authed = Router::new()
        .route("/api/v1/auth/logout", post(handlers::auth::logout))
        .route("/api/v1/auth/logout-all", post(handlers::auth::logout_all))
        .route("/api/v1/auth/csrf", get(handlers::auth::csrf))
        .route("/api/v1/auth/me", get(handlers::auth::me))
        .route("/api/v1/auth/sessions", get(handlers::auth::sessions))
        .route("/api/v1/users/me/mfa/enable", post(handlers::mfa::enable))
        .route("/api/v1/users/me/mfa/verify", post(handlers::mfa::verify))
        .route("/api/v1/notifications", get(handlers::notifications::list))
        .route(
            "/api/v1/notifications/read",
            post(handlers::notifications::mark_all_read),
        )
        .route(
            "/api/v1/notifications/{id}",
            patch(handlers::notifications::mark_read),
        )
        .route(
            "/api/v1/push/subscribe",
            post(handlers::push::subscribe).delete(handlers::push::unsubscribe),
        )
        .route("/api/v1/push/public-key", get(handlers::push::public_key))
        .route("/api/v1/ws", get(realtime::ws_handler))
        .merge(admin)
        // Inner: CSRF on mutating methods. Outer: session authentication.
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::csrf_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_session,
        ));

    let csp_header = state
        .config()
        .csp_policy
        .as_deref()
        .and_then(|policy| HeaderValue::from_str(policy).ok());

    let mut router = Router::new().merge(public).merge(authed);
    if let Some(value) = csp_header {
        router = router.layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            value,
        ));
    }

    // ServiceBuilder applies top-down: panic recovery outermost, then
    // request tracking, tracing, CORS, and the request timeout innermost.
    router
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::new())
                .layer(SetRequestIdLayer::new(
                    HeaderName::from_static(REQUEST_ID_HEADER),
                    MakeRequestUuid,
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    REQUEST_ID_HEADER,
                )))
                .layer(SetSensitiveRequestHeadersLayer::new([
                    header::AUTHORIZATION,
                    header::COOKIE,
                ]))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new())
                        .on_response(DefaultOnResponse::new()),
                )
                .layer(cors_layer(&state.config().cors_allowed_origins))
                .layer(TimeoutLayer::new(state.config().service.timeout())),
        )
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.is_empty() {
        return CorsLayer::new();
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
        ])
}

/// Bind, serve, and shut down cleanly.
///
/// On SIGINT/SIGTERM: stop accepting connections, tell every WebSocket to
/// go away, then wait up to ten seconds for in-flight work before exiting.
pub async fn run(state: AppState) -> Result<()> {
    let app = build_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config().service.port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("server listening on {addr}");

    let shutdown = CancellationToken::new();

    let bus_task = tokio::spawn(state.bus().run_subscriber(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        let hub = state.hub();
        tokio::spawn(async move {
            shutdown_signal().await;
            let closed = hub.close_all();
            tracing::info!(connections = closed, "closing websocket connections");
            shutdown.cancel();
        });
    }

    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .into_future();
    let mut serve = std::pin::pin!(serve);

    tokio::select! {
        result = &mut serve => result?,
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        } => {
            tracing::warn!("drain deadline passed with connections still open");
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(2), bus_task).await;

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }
}
