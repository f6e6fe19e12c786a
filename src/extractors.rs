use crate::error::AppError;
use axum::{
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::de::DeserializeOwned;
use tracing::warn;
use validator::Validate;

/// Query string that is deserialized and then validated.
pub struct ValidatedQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ValidatedQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| {
                warn!("Query Deserialization Error: {}", e);
                AppError::InvalidQuery(e.body_text())
            })?;

        value.validate().map_err(|e| {
            warn!(target: "validation", "Input validation failed: {:?}", e);
            AppError::ValidationError(e)
        })?;

        Ok(ValidatedQuery(value))
    }
}
