use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use civic_ledger::{
    api::{SecurityMiddlewareConfig, create_router},
    config::CivicConfig,
    service::CivicService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first - this validates all security requirements
    let config = CivicConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {:#}", e);
        eprintln!("Please check CIVIC_* environment variables.");
        e
    })?;

    init_logging(&config)?;

    info!("Starting Civic Ledger server");
    info!(
        require_https = config.security.require_https,
        postgres = config.database.postgres_enabled,
        conversion_rate = %config.ledger.conversion_rate,
        "Security and storage settings"
    );

    let service = Arc::new(
        CivicService::from_config(&config)
            .await
            .context("Failed to initialize service")?,
    );

    spawn_reconciler(
        service.clone(),
        Duration::from_secs(config.ledger.reconcile_interval_secs),
    );

    let security = SecurityMiddlewareConfig {
        max_request_size: config.security.max_request_size,
        log_requests: config.logging.log_requests,
        sanitize_logs: true,
    };
    let app = create_router(service, security).layer(TraceLayer::new_for_http());

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", bind_addr))?;

    info!("Civic Ledger listening on {}", bind_addr);

    // Serve with connect info for client IP extraction
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

/// Initialize logging. `RUST_LOG` overrides the configured level.
fn init_logging(config: &CivicConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.logging.level.to_lowercase()))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))
}

/// Periodically retry withdrawals left PENDING by signer failures
fn spawn_reconciler(service: Arc<CivicService>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            service.ledger().reconcile_pending().await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
