//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at process startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections accepted total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active authenticated sessions (gauge).
pub const WS_SESSIONS_ACTIVE: &str = "ws_sessions_active";
/// Rejected connection attempts (counter, labels: reason).
pub const WS_AUTH_FAILURES_TOTAL: &str = "ws_auth_failures_total";
/// Outbound frames dropped because a session queue was full (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Messages persisted and fanned out (counter).
pub const MESSAGES_RELAYED_TOTAL: &str = "messages_relayed_total";
/// Relay operations answered with an error frame (counter, labels: code).
pub const RELAY_ERRORS_TOTAL: &str = "relay_errors_total";
/// Typing signals forwarded (counter).
pub const TYPING_SIGNALS_TOTAL: &str = "typing_signals_total";
/// Presence transitions announced (counter, labels: kind).
pub const PRESENCE_EVENTS_TOTAL: &str = "presence_events_total";
