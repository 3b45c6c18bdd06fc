//! The one error type all handlers speak.
//!
//! Validation problems surface eagerly at parameter parsing; upstream
//! failures are caught at the single I/O wrapper per dependency and mapped
//! here. Streaming bodies never turn into a non-2xx mid-response, they
//! flush what they have and end.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error kinds with a fixed HTTP mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Unknown facet or otherwise invalid request parameters.
    #[error("{0}")]
    Validation(String),
    /// A `time`/`bbox` expression that could not be parsed.
    #[error("{0}")]
    BadInput(String),
    /// Missing or invalid bearer token.
    #[error("Not authorized")]
    Unauthorized,
    /// Empty intake export, unknown uuid, missing user info.
    #[error("{0}")]
    NotFound(String),
    /// Intake export larger than the caller allowed.
    #[error("{0}")]
    TooLarge(String),
    /// Index, cache, document store, bus or OIDC provider unreachable.
    #[error("{0}")]
    Unavailable(String),
    /// A bounded wait on the cache ran out.
    #[error("{0}")]
    Timeout(String),
    /// Unexpected internal failure.
    #[error("{0}")]
    Internal(String),
    /// Upstream answered with a non-success status we pass through.
    #[error("{detail}")]
    Upstream { status: u16, detail: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadInput(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::Validation("bad facet".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Unavailable("solr gone".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::TooLarge("too many rows".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::Upstream { status: 404, detail: "gone".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
    }
}
