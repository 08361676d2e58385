// src/lib.rs

pub mod admin;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod key_manager;
pub mod metrics;
pub mod pool;
pub mod refresher;
pub mod state;
pub mod storage;
pub mod upstream;

use crate::handlers::{health_check, proxy_handler};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{HeaderValue, Request as AxumRequest},
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use key_manager::KeyManager;
pub use state::AppState;

/// Upper bound on a buffered request body.
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/*path", any(proxy_handler))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(admin::admin_routes(Arc::clone(&state)))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn(trace_requests))
        .with_state(state)
}

/// Adds a request id span around each request and echoes it as `X-Request-ID`.
async fn trace_requests(mut req: AxumRequest<Body>, next: axum::middleware::Next) -> impl IntoResponse {
    let request_id = Uuid::new_v4();
    let start_time = Instant::now();
    let span = info_span!(
        "request",
        request_id = %request_id,
        http.method = %req.method(),
        url.path = %req.uri().path(),
    );

    req.extensions_mut().insert(request_id);

    async move {
        let mut response = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("X-Request-ID", value);
        }
        info!(
            http.response.duration = ?start_time.elapsed(),
            http.status_code = response.status().as_u16(),
            "Finished processing request"
        );
        response
    }
    .instrument(span)
    .await
}

/// Builds the state and starts the key manager (load, seed, initial refresh, loops).
pub async fn start_state(config: AppConfig) -> Result<Arc<AppState>> {
    if config.server.admin_token.is_none() {
        info!("No admin token configured; /admin routes are unauthenticated");
    }
    let state = Arc::new(AppState::new(config)?);
    state.key_manager.start().await?;
    state.key_manager.log_model_strategies();
    Ok(state)
}

/// Binds the configured address and serves until `shutdown` resolves.
pub async fn run(config: AppConfig, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| AppError::config_validation(format!("invalid listen address: {e}"), Some("server.host")))?;

    let state = start_state(config).await?;

    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(server.address = %addr, error = ?e, "Failed to bind to address. Exiting.");
        AppError::from(e)
    })?;
    info!(server.address = %addr, "Server listening");

    serve(listener, state, shutdown).await
}

/// Serves `state` on `listener` until `shutdown` resolves, then stops the key
/// manager, which drains in-flight requests and flushes the pool.
///
/// Open connections get `server.shutdown_grace_secs` to finish once the
/// signal fires; after that they are dropped.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let grace = Duration::from_secs(state.key_manager.config().server.shutdown_grace_secs);
    let signalled = CancellationToken::new();
    let trigger = signalled.clone();

    let server = axum::serve(listener, create_router(Arc::clone(&state)).into_make_service())
        .with_graceful_shutdown(async move {
            shutdown.await;
            trigger.cancel();
        })
        .into_future();

    let served = tokio::select! {
        served = server => served.map_err(AppError::from),
        () = async {
            signalled.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "Connections still open after grace period, closing them");
            Ok(())
        }
    };

    let stopped = state.key_manager.stop().await;
    served?;
    stopped?;
    info!("Server shut down gracefully.");
    Ok(())
}
