use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::CorsConfig;
use crate::error::ErrorExposure;
use crate::middleware::AccessList;
use crate::services::{HealthCheckService, OrdersService, StatsService};

#[derive(Clone)]
pub struct AppState {
    pub health_check_service: Arc<dyn HealthCheckService>,
    pub stats_service: StatsService,
    pub orders_service: OrdersService,
    pub access: AccessList,
    pub cors: CorsConfig,
    pub error_exposure: ErrorExposure,
    pub metrics_handle: Option<PrometheusHandle>,
    pub start_time: Instant,
}
