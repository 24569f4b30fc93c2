use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notification_dispatch::config::Config;
use notification_dispatch::services::init;
use notification_dispatch::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_dispatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Notification Dispatch Service");

    // Initialize database
    let pool = init::init_db(&config).await?;

    let state = Arc::new(AppState::new(pool, config.clone()));

    // Re-enqueue persisted work lost with the previous process.
    let recovered = init::recover_inflight(&state).await?;
    if recovered > 0 {
        tracing::info!(recovered, "startup recovery complete");
    }

    // Spawn the dispatch core
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let worker_handles = init::spawn_background_workers(state.clone(), shutdown_tx.clone());

    // Build router
    let app = build_router(state.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let shutdown_signal = {
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received, draining workers");
            let _ = shutdown_tx.send(());
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Wait for the worker pool to finish in-flight sends and the outbox to
    // flush before exiting.
    futures::future::join_all(worker_handles).await;
    tracing::info!("Shutdown complete");

    Ok(())
}
