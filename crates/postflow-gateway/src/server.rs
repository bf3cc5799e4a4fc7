//! HTTP server implementation using Axum.

use axum::{
    Router,
    extract::{Query, State},
    routing::get,
};
use postflow_core::config::GatewayConfig;
use postflow_monitor::SystemMonitor;
use postflow_queue::QueueManager;
use postflow_scheduler::{AutoScaler, SyncScheduler};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub queues: Arc<QueueManager>,
    pub scaler: Arc<AutoScaler>,
    pub monitor: Arc<SystemMonitor>,
    pub sync: Arc<SyncScheduler>,
    pub start_time: std::time::Instant,
    /// SHA-256 of the admin key. `None` refuses every admin request.
    admin_key_digest: Option<[u8; 32]>,
}

impl AppState {
    pub fn new(
        queues: Arc<QueueManager>,
        scaler: Arc<AutoScaler>,
        monitor: Arc<SystemMonitor>,
        sync: Arc<SyncScheduler>,
        admin_key: Option<&str>,
    ) -> Self {
        Self {
            queues,
            scaler,
            monitor,
            sync,
            start_time: std::time::Instant::now(),
            admin_key_digest: admin_key.filter(|k| !k.is_empty()).map(digest),
        }
    }

    /// Compare digests so every candidate takes the same path.
    fn key_matches(&self, candidate: &str) -> bool {
        match &self.admin_key_digest {
            Some(expected) => digest(candidate) == *expected,
            None => false,
        }
    }
}

fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

#[derive(Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

/// Admin key middleware: validates X-Admin-Key header or ?key= query.
async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if state.admin_key_digest.is_none() {
        tracing::warn!("🔒 Admin request refused: no admin key configured");
        return super::routes::unauthorized("Admin API disabled: no admin key configured");
    }

    // Check header first
    let from_header = req
        .headers()
        .get("X-Admin-Key")
        .and_then(|v| v.to_str().ok());
    if from_header.is_some_and(|k| state.key_matches(k)) {
        return next.run(req).await;
    }

    // Check query param ?key= (percent-decoded)
    if let Ok(Query(KeyQuery { key: Some(key) })) = Query::<KeyQuery>::try_from_uri(req.uri()) {
        if state.key_matches(&key) {
            return next.run(req).await;
        }
    }

    super::routes::unauthorized("Unauthorized: invalid or missing admin key")
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    // Protected routes: require the admin key
    let protected = Router::new()
        .route(
            "/api/v1/admin",
            get(super::routes::admin_get).post(super::routes::admin_post),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_admin_key,
        ));

    // Public routes: no auth
    let public = Router::new().route("/health", get(super::routes::health));

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods([axum::http::Method::GET, axum::http::Method::POST, axum::http::Method::OPTIONS])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server and run until `shutdown` resolves.
pub async fn serve<F>(state: AppState, config: &GatewayConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if state.admin_key_digest.is_none() {
        tracing::warn!("⚠️ No admin key set (gateway.admin_key or POSTFLOW_ADMIN_KEY): admin API is locked");
    }
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Admin API listening on http://{}", addr);

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
