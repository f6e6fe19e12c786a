use std::result::Result;
use std::{net::SocketAddr, sync::Arc};

use dotenvy::dotenv;
use tower::ServiceBuilder;
use tracing::warn;

use dealership_stats::{
    config::load_config,
    error::AppError,
    middleware::AccessList,
    observability::{init_metrics, init_tracing},
    repositories::{CityPools, PgOrdersRepository, PgStatsRepository},
    routes::create_router,
    services::{HealthCheckServiceImpl, OrdersService, StatsService},
    state::AppState,
};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenv().ok();

    let config = load_config()?;

    init_tracing(config.environment, &config.observability.log_level);

    tracing::info!(
        app_name = %config.app.name,
        version = %config.app.version,
        environment = %config.environment.as_str(),
        "Starting dealership stats service"
    );

    let metrics_handle = if config.observability.enable_metrics {
        Some(init_metrics()?)
    } else {
        None
    };

    let pools = CityPools::connect_lazy(&config.cities, &config.database)?;

    let stats_repo = Arc::new(PgStatsRepository::new(pools.clone()));
    let orders_repo = Arc::new(PgOrdersRepository::new(pools.clone()));

    let app_state = AppState {
        health_check_service: Arc::new(HealthCheckServiceImpl::new(
            pools.clone(),
            config.database.clone(),
        )),
        stats_service: StatsService::new(stats_repo),
        orders_service: OrdersService::new(orders_repo),
        access: AccessList::new(config.security.white_list.iter().copied()),
        cors: config.cors.clone(),
        error_exposure: config.error_exposure(),
        metrics_handle,
        start_time: std::time::Instant::now(),
    };

    let app = create_router(app_state)?.layer(
        ServiceBuilder::new().layer(tower_http::timeout::TimeoutLayer::with_status_code(
            axum::http::StatusCode::REQUEST_TIMEOUT,
            config.server.request_timeout(),
        )),
    );

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .map_err(|e| AppError::ConfigError(format!("Invalid bind address: {}", e)))?;

    tracing::info!("Server listening on http://{}/swagger-ui", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::ConfigError(format!("Failed to bind: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::ConfigError(format!("Server error: {}", e)))?;

    tracing::info!("Shutting down gracefully...");
    pools.close().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { tracing::info!("Received SIGINT (Ctrl+C)"); },
        _ = terminate => { tracing::info!("Received SIGTERM"); },
    }

    warn!("Signal received, starting graceful shutdown...");
}
