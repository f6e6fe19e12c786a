use axum::{
    extract::{Request, State},
    http::{StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

pub type AppResult<T> = Result<T, AppError>;

pub const MAX_SEARCH_LENGTH: usize = 21;

pub const SEARCH_TOO_LONG_MESSAGE: &str = "Максимальная длина поискового запроса - 21 символ.";

/// How much of an error reaches the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorExposure {
    /// Raw messages and all details.
    Debug,
    /// Safe messages; details only for client input errors.
    #[default]
    Safe,
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorId(pub Uuid);

impl Default for ErrorId {
    fn default() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything needed to render an error response. `AppError` renders the
/// safe form and leaves the report in the response extensions, so
/// [`error_exposure_middleware`] can re-render it for debug exposure.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    status: StatusCode,
    error_id: ErrorId,
    code: String,
    message: String,
    safe_message: String,
    details: Option<serde_json::Value>,
    exposes_details: bool,
}

impl ErrorReport {
    fn from_error(error: &AppError) -> Self {
        Self {
            status: error.status_code(),
            error_id: error.error_id(),
            code: error.error_code(),
            message: error.to_string(),
            safe_message: error.safe_message().into_owned(),
            details: error.details(),
            exposes_details: error.exposes_details(),
        }
    }

    pub fn render(self, exposure: ErrorExposure) -> Response {
        let (message, details) = match exposure {
            ErrorExposure::Debug => (self.message.clone(), self.details.clone()),
            ErrorExposure::Safe => {
                let safe_details = if self.exposes_details {
                    self.details.clone()
                } else {
                    None
                };
                (self.safe_message.clone(), safe_details)
            }
        };

        let body = Json(ErrorResponseBody {
            error: ErrorPayload {
                code: self.code.clone(),
                message,
                error_id: self.error_id.to_string(),
                details,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        });

        let mut response = (self.status, body).into_response();

        let error_id_header =
            HeaderValue::from_str(&self.error_id.to_string()).unwrap_or_else(|_| {
                tracing::warn!("Failed to format error_id as header value");
                HeaderValue::from_static("invalid-error-id")
            });
        response.headers_mut().insert("X-Error-Id", error_id_header);
        response.extensions_mut().insert(self);

        response
    }
}

/// Re-renders error responses for the configured exposure.
pub async fn error_exposure_middleware(
    State(exposure): State<ErrorExposure>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;

    if exposure == ErrorExposure::Safe {
        return response;
    }

    match response.extensions_mut().remove::<ErrorReport>() {
        Some(report) => report.render(exposure),
        None => response,
    }
}

#[derive(serde::Serialize)]
struct ErrorResponseBody {
    error: ErrorPayload,
}

#[derive(serde::Serialize)]
struct ErrorPayload {
    code: String,
    message: String,
    error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
    timestamp: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation failed")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid query parameters: {0}")]
    InvalidQuery(String),

    #[error("Unavailable block_id: {0}")]
    InvalidBlock(String),

    #[error("{}", SEARCH_TOO_LONG_MESSAGE)]
    SearchTermTooLong { length: usize },

    #[error("Unknown city: {0}")]
    UnknownCity(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Context: {context}")]
    WithContext {
        #[source]
        source: Box<AppError>,
        context: String,
        error_id: ErrorId,
    },
}

impl AppError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            source: Box::new(self),
            context: context.into(),
            error_id: ErrorId::default(),
        }
    }

    pub fn error_id(&self) -> ErrorId {
        match self {
            Self::WithContext { error_id, .. } => *error_id,
            _ => ErrorId::default(),
        }
    }

    pub fn error_code(&self) -> String {
        match self {
            Self::DatabaseError(_) => "DATABASE_ERROR".to_string(),
            Self::ConfigError(_) => "CONFIGURATION_ERROR".to_string(),
            Self::ValidationError(_) => "VALIDATION_ERROR".to_string(),
            Self::InvalidQuery(_) => "INVALID_INPUT".to_string(),
            Self::InvalidBlock(_) => "INVALID_BLOCK".to_string(),
            Self::SearchTermTooLong { .. } => "SEARCH_TERM_TOO_LONG".to_string(),
            Self::UnknownCity(_) => "UNKNOWN_CITY".to_string(),
            Self::Unauthorized => "UNAUTHORIZED".to_string(),
            Self::Forbidden => "FORBIDDEN".to_string(),
            Self::WithContext { source, .. } => source.error_code(),
        }
    }

    pub fn safe_message(&self) -> Cow<'static, str> {
        match self {
            Self::ValidationError(_) => "The provided data failed validation".into(),
            Self::InvalidQuery(_) => "The request contains invalid data".into(),
            Self::InvalidBlock(_) => "Unavailable block_id".into(),
            Self::SearchTermTooLong { .. } => SEARCH_TOO_LONG_MESSAGE.into(),
            Self::UnknownCity(_) => "The requested city is not configured".into(),
            Self::Unauthorized => "Authentication is required to access this resource".into(),
            Self::Forbidden => "You do not have permission to perform this action".into(),
            Self::DatabaseError(_) => {
                "An internal error occurred. Please contact support if the problem persists".into()
            }
            Self::ConfigError(_) => "Service configuration error".into(),
            Self::WithContext { source, .. } => source.safe_message(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            Self::InvalidBlock(_) => StatusCode::BAD_REQUEST,
            Self::SearchTermTooLong { .. } => StatusCode::BAD_REQUEST,
            Self::UnknownCity(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::WithContext { source, .. } => source.status_code(),
            Self::DatabaseError(_) | Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::ValidationError(e) => {
                let errors = e
                    .field_errors()
                    .iter()
                    .map(|(field, errs)| {
                        let messages: Vec<String> = errs
                            .iter()
                            .map(|err| {
                                err.message
                                    .as_ref()
                                    .map(|m| m.to_string())
                                    .unwrap_or_else(|| err.code.to_string())
                            })
                            .collect();
                        (field.to_string(), messages)
                    })
                    .collect::<std::collections::HashMap<String, Vec<String>>>();

                serde_json::to_value(errors).ok()
            }
            Self::InvalidQuery(msg) => Some(serde_json::json!({ "context": msg })),
            Self::InvalidBlock(block_id) => Some(serde_json::json!({
                "block_id": block_id,
                "available": ["finance", "orders", "diagnostic_packages"],
            })),
            Self::SearchTermTooLong { length } => Some(serde_json::json!({
                "length": length,
                "max_length": MAX_SEARCH_LENGTH,
            })),
            Self::WithContext {
                source, context, ..
            } => {
                let mut details = source.details().unwrap_or_else(|| serde_json::json!({}));
                if let Some(obj) = details.as_object_mut() {
                    obj.insert("context".to_string(), serde_json::json!(context));
                }
                Some(details)
            }
            _ => None,
        }
    }

    /// Client input errors whose details are shown even in safe exposure.
    fn exposes_details(&self) -> bool {
        match self {
            Self::ValidationError(_) | Self::InvalidBlock(_) | Self::SearchTermTooLong { .. } => {
                true
            }
            Self::WithContext { source, .. } => source.exposes_details(),
            _ => false,
        }
    }

    pub fn log_error(&self, error_id: ErrorId) {
        let chain = self.format_error_chain();

        match self {
            Self::WithContext {
                source, context, ..
            } => {
                if self.status_code().is_server_error() {
                    error!(
                        error_id = %error_id,
                        error_chain = %chain,
                        immediate_context = %context,
                        source_error = ?source,
                        "Server error occurred with context"
                    );
                } else {
                    warn!(
                        error_id = %error_id,
                        error_chain = %chain,
                        immediate_context = %context,
                        "Client error occurred with context"
                    );
                }
            }
            _ => {
                if self.status_code().is_server_error() {
                    error!(
                        error_id = %error_id,
                        error_code = %self.error_code(),
                        error_message = %self,
                        "Server error occurred"
                    );
                } else {
                    warn!(
                        error_id = %error_id,
                        error_code = %self.error_code(),
                        "Client error occurred"
                    );
                }
            }
        }
    }

    fn format_error_chain(&self) -> String {
        let mut parts = vec![];
        let mut current: &AppError = self;

        loop {
            match current {
                AppError::WithContext {
                    source, context, ..
                } => {
                    parts.push(format!("[Context: {}]", context));
                    current = source;
                }
                other => {
                    parts.push(format!("[Root: {}]", other));
                    break;
                }
            }
        }

        parts.reverse();
        parts.join(" -> ")
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let report = ErrorReport::from_error(&self);
        self.log_error(report.error_id);
        report.render(ErrorExposure::Safe)
    }
}
