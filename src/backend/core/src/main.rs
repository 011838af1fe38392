//! Stratum Server - Main entry point

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;

use stratum_core::{
    api::{self, AppState},
    auth::TokenService,
    config::Config,
    db::{default_registry, Database},
    rbac::{PermissionStore, ProtectedGroups},
    telemetry::{init_logging, init_metrics},
};

#[derive(Parser)]
#[command(name = "stratum-server", version, about = "Stratum multi-tenant API server")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "STRATUM_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    init_logging(&config.logging)?;
    let metrics = init_metrics(&config.metrics, "stratum-server")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.server.domain,
        "Starting Stratum Server"
    );

    let db = Database::connect(&config.database).await?;
    let registry = Arc::new(default_registry()?);
    let store = Arc::new(PermissionStore::new(ProtectedGroups::system()));
    let tokens = Arc::new(TokenService::new(&config.jwt)?);

    let app_state = AppState::new(db.pool().clone(), registry, store, tokens, metrics);

    // Bring every existing tenant up to the current baseline.
    let report = app_state.bootstrapper.initialize_all().await?;
    if !report.is_clean() {
        tracing::warn!(
            failed = report.failed.len(),
            total = report.total(),
            "Some tenants failed to initialize"
        );
    }

    let app = api::build_router(app_state, &config.server.domain, config.server.request_timeout);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    db.pool().close().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
