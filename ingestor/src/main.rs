use axum::{routing::get, Router};
use meter_ingestor::config::Config;
use meter_ingestor::maintenance::Maintenance;
use meter_ingestor::rate_limit::RateLimiter;
use meter_ingestor::{metrics, rest, IngestService, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Initialize logging; RUST_LOG takes precedence over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting smart energy meter ingestor");
    info!("HTTP server: {}", config.http_addr());
    info!("Database: {}", config.database_path.display());
    info!(
        "Retention: {} days, backups: {}",
        config.cleanup_days,
        config
            .backup_interval
            .map(|d| format!("every {}s into {}", d.as_secs(), config.backup_dir.display()))
            .unwrap_or_else(|| "disabled".to_string())
    );

    // Initialize metrics
    metrics::init_metrics();

    // Open the store
    let store = match Store::open(&config.database_path).await {
        Ok(store) => Arc::new(
            store.with_query_limits(config.default_query_limit, config.max_query_limit),
        ),
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = store
        .log_system_event("INFO", "Server started", Some("main"))
        .await
    {
        error!("Failed to record startup event: {}", e);
    }

    // Spawn maintenance task
    let maintenance = Maintenance {
        cleanup_days: config.cleanup_days,
        cleanup_interval: config.cleanup_interval,
        backup_interval: config.backup_interval,
        backup_dir: config.backup_dir.clone(),
    };
    let maintenance_store = store.clone();
    let maintenance_handle = tokio::spawn(async move {
        maintenance.run(maintenance_store).await;
    });

    // Build HTTP app with REST API and metrics endpoint
    let limiter = Arc::new(RateLimiter::per_minute(
        config.rate_limit_enabled,
        config.rate_limit_per_minute,
    ));
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(IngestService::new(store.clone()), limiter))
        .layer(rest::cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http());

    // Start HTTP server
    let http_addr = config.http_addr();
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = maintenance_handle => {
            error!("Maintenance task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    if let Err(e) = store
        .log_system_event("INFO", "Server stopped", Some("main"))
        .await
    {
        error!("Failed to record shutdown event: {}", e);
    }
    store.close().await;

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
