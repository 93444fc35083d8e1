use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use herald_store::Database;

use crate::auth::{self, AuthGate};
use crate::presence::PresenceTracker;
use crate::rooms::RoomIndex;
use crate::sessions::{self, SessionRegistry};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub jwt_secret: String,
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            jwt_secret: "your_shared_secret_here".into(),
            max_send_queue: 256,
            request_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Read configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            jwt_secret: std::env::var("JWT_SHARED_SECRET").unwrap_or(defaults.jwt_secret),
            max_send_queue: defaults.max_send_queue,
            request_timeout_secs: defaults.request_timeout_secs,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: Arc<SessionRegistry>,
    pub rooms: Arc<RoomIndex>,
    pub presence: Arc<PresenceTracker>,
    pub auth: Arc<AuthGate>,
    /// `None` when no Prometheus recorder is installed (tests).
    pub metrics: Option<PrometheusHandle>,
}

/// Build the Axum router with all routes. The timeout covers the plain
/// HTTP routes only; `/ws` upgrades are long-lived.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let http = Router::new()
        .route("/health", get(health_handler))
        .route("/presence/online-users", get(online_users_handler))
        .route("/presence/stats", get(presence_stats_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TimeoutLayer::new(request_timeout));

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(http)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle exposing the bound port.
pub async fn start(
    config: ServerConfig,
    db: Database,
    metrics: Option<PrometheusHandle>,
) -> Result<ServerHandle, std::io::Error> {
    let registry = Arc::new(SessionRegistry::new(config.max_send_queue));
    let rooms = Arc::new(RoomIndex::new());
    let presence = Arc::new(PresenceTracker::new());
    let auth = Arc::new(AuthGate::new(&config.jwt_secret));

    // Reap sessions whose heartbeat lapsed (every 60s)
    let _cleanup = sessions::start_cleanup_task(
        Arc::clone(&registry),
        Arc::clone(&rooms),
        Arc::clone(&presence),
        Duration::from_secs(60),
    );

    let app_state = AppState {
        db,
        registry,
        rooms,
        presence,
        auth,
        metrics,
    };

    let router = build_router(app_state, Duration::from_secs(config.request_timeout_secs));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "herald server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _cleanup,
    })
}

/// Handle returned by `start()`. Owns the serve and cleanup tasks.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// WebSocket upgrade handler. A bearer header here lets the client skip
/// the opening auth frame.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let bearer = auth::bearer_token(&headers);
    ws.on_upgrade(move |socket| sessions::handle_connection(socket, state, bearer))
}

/// Health check HTTP endpoint: verifies the store answers a trivial query.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .is_ok();

    if db_ok {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "degraded"})),
        )
    }
}

/// One row per live session; a user connected twice appears twice.
async fn online_users_handler(State(state): State<AppState>) -> impl IntoResponse {
    let users: Vec<serde_json::Value> = state
        .registry
        .list_details()
        .iter()
        .map(|(session_id, identity)| {
            serde_json::json!({
                "sessionId": session_id,
                "userId": identity.external_id,
            })
        })
        .collect();

    Json(serde_json::json!({ "count": users.len(), "users": users }))
}

async fn presence_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "onlineUsersCount": state.presence.online_count(),
        "totalSessions": state.registry.count(),
        "recentEventsCount": state.presence.recent_event_count(),
    }))
}

/// Prometheus exposition text, or 503 when no recorder is installed.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}
