//! Main Entrypoint for the Voicegate API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Loading the canned timeout-test utterance, when configured.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use bytes::Bytes;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use voicegate_api::{
    call::registry::SessionRegistry, config::Config, db::Db, router::create_router,
    state::AppState,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Db::new(pool);
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Load the timeout-test utterance, if configured ---
    let timeout_audio = match (&config.timeout_test_audio_path, config.timeout_test_enabled) {
        (Some(path), true) => match std::fs::read(path) {
            Ok(bytes) => {
                info!(path = %path.display(), bytes = bytes.len(), "timeout-test utterance loaded");
                Some(Bytes::from(bytes))
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read timeout-test audio; monitor disabled");
                None
            }
        },
        (None, true) => {
            warn!("TIMEOUT_TEST_ENABLED is set but TIMEOUT_TEST_AUDIO is not; monitor disabled");
            None
        }
        _ => None,
    };

    let registry = Arc::new(SessionRegistry::new());
    let app_state = Arc::new(AppState {
        config: config.clone(),
        db,
        registry: registry.clone(),
        timeout_audio,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        brain = ?config.brain,
        public_host = %config.public_host,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Hang up anything still live before exiting.
    registry.close_all().await;
    info!("Server has shut down.");
    Ok(())
}
