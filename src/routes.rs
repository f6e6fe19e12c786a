use axum::{
    Router,
    body::Body,
    extract::Request,
    http::HeaderName,
    middleware::{from_fn, from_fn_with_state},
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::Level;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::create_cors_layer;
use crate::error::{AppResult, error_exposure_middleware};
use crate::handlers;
use crate::middleware::{REQUEST_ID_HEADER, access_guard_middleware, request_context_middleware};
use crate::models::*;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::health_check_handler,
        crate::handlers::prometheus_metrics_handler,
        crate::handlers::get_stats_handler,
        crate::handlers::list_orders_handler,
    ),
    components(
        schemas(
            HealthResponse,
            CityHealthReport,
            BlockKind,
            Metric,
            Submetric,
            MetricBlock,
            OrderSummary,
            OrdersPage,
        )
    ),
    tags(
        (name = "Stats", description = "Dealership metric blocks per city"),
        (name = "Orders", description = "Filtered work-order listings"),
        (name = "System", description = "Health and metrics"),
    ),
    info(
        title = "Dealership Stats API",
        version = "0.1.0",
        description = "Revenue, order and diagnostic package metrics for the dealership chain"
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> AppResult<Router> {
    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    let cors_layer = create_cors_layer(&state.cors)?;

    let outer_layers = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            x_request_id.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    let request_id = request
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");

                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(tower_http::LatencyUnit::Millis),
                ),
        )
        .layer(from_fn(request_context_middleware))
        .layer(CompressionLayer::new())
        .layer(from_fn_with_state(
            state.error_exposure,
            error_exposure_middleware,
        ));

    let v1_routes = city_routes()
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .route_layer(from_fn_with_state(
            state.access.clone(),
            access_guard_middleware,
        ));

    Ok(Router::new()
        .route("/health", get(handlers::health_check_handler))
        .route("/metrics", get(handlers::prometheus_metrics_handler))
        .nest("/api/v1", v1_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(outer_layers)
        .layer(cors_layer)
        .with_state(state))
}

fn city_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/cities/{city}/stats/{block_id}",
            get(handlers::get_stats_handler),
        )
        .route("/cities/{city}/orders", get(handlers::list_orders_handler))
}
