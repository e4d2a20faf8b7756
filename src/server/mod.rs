//! HTTP/WebSocket surface for the gateway.
//!
//! Uses `axum` for HTTP/WS routing with CORS support. Routes:
//! - `GET /` plain-text liveness
//! - `GET /health` JSON health stats
//! - `GET /api/prices` cached snapshots with a staleness flag
//! - `GET /balances` cached wallet balances
//! - `GET /ws` price stream

pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::core::{
    current_time_ms, Broadcaster, ConnectionRegistry, Gateway, LifecycleState, MarketSnapshot,
    MarketState, UpstreamMonitor,
};

/// Preflight cache lifetime
pub const CORS_MAX_AGE: Duration = Duration::from_secs(86_400);

/// Shared application state for the HTTP/WS server.
#[derive(Clone)]
pub struct AppState {
    pub market: Arc<MarketState>,
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub monitor: Arc<UpstreamMonitor>,
    pub lifecycle: watch::Receiver<LifecycleState>,
    /// Cancelled when the gateway begins stopping; ends every stream session
    pub shutdown: CancellationToken,
    /// Stream sessions run on this tracker so shutdown can wait for them
    pub tasks: TaskTracker,
    /// Snapshots older than this are reported stale
    pub max_snapshot_age_ms: u64,
}

impl AppState {
    pub fn from_gateway(gateway: &Gateway) -> Self {
        Self {
            market: Arc::clone(gateway.market_state()),
            registry: Arc::clone(gateway.registry()),
            broadcaster: Arc::clone(gateway.broadcaster()),
            monitor: Arc::clone(gateway.monitor()),
            lifecycle: gateway.subscribe_state(),
            shutdown: gateway.shutdown_token(),
            tasks: gateway.task_tracker(),
            max_snapshot_age_ms: gateway.config().max_snapshot_age_ms(),
        }
    }
}

/// Build the router with every gateway route plus `extra`, then apply the
/// CORS policy to all of them.
///
/// The CORS layer only wraps routes present when it is applied, so extra
/// routes must come in through `extra` rather than a later `merge`.
pub fn build_router(state: AppState, extra: Router) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/prices", get(prices_handler))
        .route("/balances", get(balances_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .merge(extra)
        .layer(cors_layer())
}

/// Any origin, with credentials. The request origin is mirrored back since
/// a wildcard origin cannot be combined with credentials.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
            header::ACCEPT,
        ])
        .allow_credentials(true)
        .max_age(CORS_MAX_AGE)
}

/// GET /
async fn root_handler() -> &'static str {
    "Hello World"
}

/// GET /health: server status
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let lifecycle = *state.lifecycle.borrow();
    Json(serde_json::json!({
        "status": "ok",
        "lifecycle": lifecycle,
        "connections": state.registry.len(),
        "monitors": state.monitor.state(),
        "snapshot_updates": state.broadcaster.updates_seen(),
        "timestamp": current_time_ms(),
    }))
}

/// One cached snapshot as served over REST
#[derive(Debug, Serialize)]
pub struct PriceView {
    #[serde(flatten)]
    pub snapshot: Arc<MarketSnapshot>,
    pub stale: bool,
}

/// GET /api/prices: snapshot of all cached prices
async fn prices_handler(State(state): State<AppState>) -> Json<Vec<PriceView>> {
    let now = current_time_ms();
    let mut prices: Vec<PriceView> = state
        .market
        .prices()
        .into_iter()
        .map(|snapshot| PriceView {
            stale: state
                .market
                .is_stale(snapshot.instrument, now, state.max_snapshot_age_ms),
            snapshot,
        })
        .collect();
    prices.sort_by_key(|view| view.snapshot.instrument.symbol());
    Json(prices)
}

/// GET /balances: cached wallet balances
async fn balances_handler(State(state): State<AppState>) -> Response {
    match state.market.read_balances() {
        Some(balances) => Json(balances).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Balances not yet available" })),
        )
            .into_response(),
    }
}
