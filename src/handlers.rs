use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json},
};

use crate::error::{AppError, AppResult};
use crate::extractors::ValidatedQuery;
use crate::models::{
    BlockKind, City, CityHealthReport, HealthResponse, HealthStatus, MetricBlock, OrdersPage,
    OrdersQuery, StatsQuery,
};
use crate::state::AppState;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "All city databases are healthy", body = HealthResponse),
        (status = 200, description = "At least one city database is degraded", body = HealthResponse),
        (status = 503, description = "Service Unhealthy")
    ),
    tag = "System"
)]
pub async fn health_check_handler(State(state): State<AppState>) -> impl IntoResponse {
    let system_health = state.health_check_service.check_full().await;

    let http_status = match &system_health.overall {
        HealthStatus::Healthy | HealthStatus::Degraded(_) => StatusCode::OK,
        HealthStatus::Unhealthy(reason) => {
            tracing::error!("Health check failed: {}", reason);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };

    let databases = system_health
        .databases
        .iter()
        .map(|(city, status)| {
            let (label, details) = match status {
                HealthStatus::Healthy => ("Up", None),
                HealthStatus::Degraded(reason) => ("Degraded", Some(reason.clone())),
                HealthStatus::Unhealthy(reason) => ("Down", Some(reason.clone())),
            };
            CityHealthReport {
                city: city.to_string(),
                status: label.to_string(),
                details,
            }
        })
        .collect();

    let response = HealthResponse {
        status: match http_status {
            StatusCode::OK => "OK",
            _ => "ERROR",
        }
        .to_string(),
        databases,
        response_time_ms: system_health.response_time_ms,
        uptime_seconds: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (http_status, Json(response)).into_response()
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus exposition", body = String),
        (status = 404, description = "Metrics export is disabled")
    ),
    tag = "System"
)]
pub async fn prometheus_metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/cities/{city}/stats/{block_id}",
    params(
        ("city" = String, Path, description = "Dealership city code"),
        ("block_id" = String, Path, description = "finance, orders or diagnostic_packages"),
        StatsQuery
    ),
    responses(
        (status = 200, description = "Metric block", body = MetricBlock),
        (status = 400, description = "Unknown block id or invalid dates"),
        (status = 404, description = "City is not configured"),
        (status = 500, description = "Database failure")
    ),
    tag = "Stats"
)]
pub async fn get_stats_handler(
    State(state): State<AppState>,
    Path((city, block_id)): Path<(String, String)>,
    ValidatedQuery(query): ValidatedQuery<StatsQuery>,
) -> AppResult<Json<MetricBlock>> {
    let city = City::new(&city)?;
    let block: BlockKind = block_id.parse()?;

    let block = state
        .stats_service
        .get_metrics(city, query.range(), block, query.mode())
        .await?;

    Ok(Json(block))
}

#[utoipa::path(
    get,
    path = "/api/v1/cities/{city}/orders",
    params(
        ("city" = String, Path, description = "Dealership city code"),
        OrdersQuery
    ),
    responses(
        (status = 200, description = "Total match count and the requested page", body = OrdersPage),
        (status = 400, description = "Search term too long or invalid parameters"),
        (status = 404, description = "City is not configured"),
        (status = 500, description = "Database failure")
    ),
    tag = "Orders"
)]
pub async fn list_orders_handler(
    State(state): State<AppState>,
    Path(city): Path<String>,
    ValidatedQuery(query): ValidatedQuery<OrdersQuery>,
) -> AppResult<Json<OrdersPage>> {
    let city = City::new(&city)?;
    let offset = usize::try_from(query.offset)
        .map_err(|_| AppError::InvalidQuery("offset is out of range".into()))?;

    let page = state
        .orders_service
        .get_orders_count_and_list(
            &city,
            query.range(),
            query.search.as_deref(),
            &query.tag_names(),
            offset,
            query.page,
        )
        .await?;

    Ok(Json(page))
}
