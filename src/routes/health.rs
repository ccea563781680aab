//! Health check HTTP route handlers
//!
//! Provides endpoints for checking the health of the sync server and its
//! dependencies:
//! - `GET /health` - Simple liveness check (returns 200 OK)
//! - `GET /health/live` - Kubernetes-style liveness probe
//! - `GET /health/ready` - Readiness check (verifies the database)

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use sqlx::PgPool;

use crate::ws::{ConnectionLimiter, SessionPubSub, SessionRegistry};

/// Shared application state for health check handlers
#[derive(Clone)]
pub struct HealthState {
    pub pool: PgPool,
    pub pubsub: SessionPubSub,
    pub registry: SessionRegistry,
    pub limiter: ConnectionLimiter,
}

/// Create health check router
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(simple_health))
        .route("/live", get(liveness_probe))
        .route("/ready", get(readiness_probe))
        .with_state(state)
}

/// Simple health check - always returns OK if the server is running
async fn simple_health() -> &'static str {
    "OK"
}

/// Liveness probe for Kubernetes
///
/// Returns 200 if the server process is running and can handle requests.
/// This should NOT check external dependencies - that's what readiness is for.
async fn liveness_probe() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness probe - checks the database and the broadcast fabric and
/// reports sync-plane stats
///
/// # Response
/// - 200 OK if the database answers and the fabric is not degraded
/// - 503 Service Unavailable otherwise
async fn readiness_probe(State(state): State<HealthState>) -> impl IntoResponse {
    let database_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();

    // A degraded fabric no longer receives events from other processes;
    // the process should be rotated out rather than serve stale rooms.
    let fabric_degraded = state.pubsub.is_degraded();
    let ready = database_ok && !fabric_degraded;

    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let fabric = if fabric_degraded {
        "redis_degraded"
    } else if state.pubsub.is_redis_backed() {
        "redis"
    } else {
        "in_memory"
    };

    let response = serde_json::json!({
        "status": if ready { "ready" } else { "not_ready" },
        "database": database_ok,
        "fabric": fabric,
        "active_sessions": state.registry.session_count(),
        "active_connections": state.limiter.active(),
    });

    (status_code, Json(response))
}
