//! Coordinator Server Binary
//!
//! Runs the mesh coordinator HTTP server.

use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mesh_coordinator::{
    create_router, AppState, Coordinator, FileStore, MemoryStore, SealedStateStore, ServerConfig,
};

#[tokio::main]
async fn main() {
    let config = ServerConfig::from_env().expect("Invalid configuration");

    // Initialize logging
    let log_level = config.log_level.parse().unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Initialize sealed state storage
    let store: Arc<dyn SealedStateStore> = match &config.state_dir {
        Some(dir) => Arc::new(FileStore::new(dir).expect("Failed to open state directory")),
        None => Arc::new(MemoryStore::new()),
    };

    info!(
        port = config.port,
        state_dir = ?config.state_dir,
        coordinator = ?config.coordinator,
        "Starting mesh coordinator"
    );

    let coordinator = Arc::new(Coordinator::new(config.coordinator.clone()).with_store(store));
    let state = coordinator.start().expect("Failed to start coordinator");
    info!(state = %state, "Coordinator ready");

    // Build router
    let app = create_router(Arc::new(AppState {
        coordinator: coordinator.clone(),
    }));

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    info!(addr = %addr, "Coordinator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    if let Err(e) = coordinator.stop() {
        error!(error = %e, "Coordinator did not stop cleanly");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
