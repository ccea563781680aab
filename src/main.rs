use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, routing::get, Router};
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use watchparty_sync::config::Config;
use watchparty_sync::repositories::{GroupMemberRepository, WatchSessionRepository};
use watchparty_sync::routes::{health_router, HealthState};
use watchparty_sync::services::auth::{AuthConfig, AuthService};
use watchparty_sync::services::membership::{MembershipVerifier, PgMembershipVerifier};
use watchparty_sync::ws::{
    ws_handler, ConnectionLimiter, SessionPubSub, SessionRegistry, WsSettings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_sync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    tracing::info!("Starting watch party sync server on port {}", config.port);

    // Initialize database pool
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await?;
    tracing::info!("Database connection established");

    // Membership lookups go straight to the tables the CRUD service owns
    let sessions = WatchSessionRepository::new(pool.clone());
    let members = GroupMemberRepository::new(pool.clone());
    let membership: Arc<dyn MembershipVerifier> =
        Arc::new(PgMembershipVerifier::new(sessions, members));
    tracing::info!("Membership verifier initialized");

    // Create AuthService
    let auth_service = AuthService::new(AuthConfig::new(config.jwt_secret.clone()));
    tracing::info!("AuthService initialized");

    // Broadcast fabric: Redis when reachable, process-local otherwise
    let pubsub = SessionPubSub::try_with_redis(&config.redis_url).await;
    if pubsub.is_redis_backed() {
        tracing::info!("Broadcast fabric connected to Redis");
    } else {
        tracing::warn!(
            "Broadcast fabric running in-memory; events will not cross server processes"
        );
    }

    let registry = SessionRegistry::new(pubsub.clone());
    let limiter = ConnectionLimiter::new(config.ws_max_connections);
    let settings = WsSettings::new(Duration::from_secs(config.ws_idle_timeout_secs));

    // Create health check state
    let health_state = HealthState {
        pool: pool.clone(),
        pubsub: pubsub.clone(),
        registry: registry.clone(),
        limiter: limiter.clone(),
    };

    // Build the router
    let app = Router::new()
        .route("/", get(root))
        // WebSocket sync endpoint
        .route("/ws", get(ws_handler))
        // Nested health routes: /health, /health/live, /health/ready
        .nest("/health", health_router(health_state))
        // Services as extensions for the WebSocket handler
        .layer(Extension(registry))
        .layer(Extension(pubsub))
        .layer(Extension(auth_service))
        .layer(Extension(membership))
        .layer(Extension(limiter))
        .layer(Extension(settings))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn root() -> &'static str {
    "Watch Party Sync - Group Watch Session Synchronizer"
}
