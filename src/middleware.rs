use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::AppError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const RESPONSE_TIME_HEADER: &str = "x-response-time-ms";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub start_time: Instant,
    pub path: String,
    pub method: String,
}

impl RequestContext {
    pub fn from_request(req: &Request) -> Self {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let user_id = req
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(String::from);

        Self {
            request_id,
            user_id,
            start_time: Instant::now(),
            path: req.uri().path().to_string(),
            method: req.method().to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start_time.elapsed().as_millis()
    }

    pub fn create_span(&self) -> tracing::Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            user_id = ?self.user_id,
            path = %self.path,
            method = %self.method,
        )
    }
}

pub async fn request_context_middleware(request: Request, next: Next) -> Response {
    let context = RequestContext::from_request(&request);

    let span = context.create_span();

    let mut response = next.run(request).instrument(span).await;

    let duration_ms = context.elapsed_ms();
    let status = response.status();

    if let Ok(value) = HeaderValue::from_str(&context.request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    if let Ok(value) = HeaderValue::from_str(&duration_ms.to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RESPONSE_TIME_HEADER), value);
    }

    if status.is_server_error() {
        tracing::error!(
            target: "http_request_complete",
            request_id = %context.request_id,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            target: "http_request_complete",
            request_id = %context.request_id,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Request completed with client error"
        );
    } else {
        tracing::info!(
            target: "http_request_complete",
            request_id = %context.request_id,
            status = %status.as_u16(),
            duration_ms = %duration_ms,
            "Request completed successfully"
        );
    }

    metrics::histogram!("http_request_duration_ms", "method" => context.method.clone())
        .record(duration_ms as f64);
    metrics::counter!("http_requests_total", "status" => status.as_u16().to_string())
        .increment(1);

    response
}

/// Staff user ids permitted to call the API.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    allowed: Arc<HashSet<i64>>,
}

impl AccessList {
    pub fn new(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            allowed: Arc::new(ids.into_iter().collect()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn check(&self, user_id: Option<&str>) -> Result<(), AppError> {
        if self.is_open() {
            return Ok(());
        }

        let id = user_id
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .ok_or(AppError::Unauthorized)?;

        if self.allowed.contains(&id) {
            Ok(())
        } else {
            tracing::warn!(user_id = id, "Rejected user outside the white list");
            Err(AppError::Forbidden)
        }
    }
}

pub async fn access_guard_middleware(
    State(access): State<AccessList>,
    request: Request,
    next: Next,
) -> Response {
    let user_id = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok());

    match access.check(user_id) {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
