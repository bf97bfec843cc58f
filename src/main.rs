use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use greencycle::api::{self, AppState};
use greencycle::config::Config;
use greencycle::db;
use greencycle::models::tier::TierTable;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "greencycle=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting GreenCycle server...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    // Tier thresholds are validated at construction, before serving traffic
    let tiers = TierTable::default();

    // Build application state
    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
        tiers,
    };

    // Token-gated API routes; the health probe stays open
    let api_routes = Router::new()
        .merge(api::rewards::router())
        .merge(api::locations::router())
        .merge(api::pickups::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::middleware::auth::require_service_token,
        ));

    // Build router
    let app = Router::new()
        .route("/health", get(api::health::health_check))
        .merge(api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, cleaning up...");
}
