//! Error types for the relay API layer.

use std::error::Error;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use blockrelay_service::registry::RegistryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for API operations.
///
/// These errors are only raised before a response is started. Failures while streaming a body
/// cut the body short instead, see [`download`](crate::endpoints::download).
#[derive(Debug, Error)]
pub enum ApiError {
    /// The object is unknown or could not be resolved.
    #[error("object not found")]
    NotFound(#[source] RegistryError),

    /// The requested range lies entirely outside the object.
    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable {
        /// Total size of the object.
        size: u64,
    },

    /// No upstream worker is available to serve the request.
    #[error("no upstream worker available")]
    Unavailable,

    /// Server errors, indicating that something went wrong when executing a request.
    #[error("server error: {0}")]
    Server(#[source] Box<dyn Error + Send + Sync>),
}

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// A JSON error response returned by the API.
#[derive(Serialize, Deserialize, Debug)]
pub struct ApiErrorResponse {
    /// The main error message.
    #[serde(default)]
    pub detail: Option<String>,
    /// Chain of error causes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl ApiErrorResponse {
    /// Creates an error response from an error, extracting the full cause chain.
    pub fn from_error<E: Error + ?Sized>(error: &E) -> Self {
        let detail = Some(error.to_string());

        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(s) = source {
            causes.push(s.to_string());
            source = s.source();
        }

        Self { detail, causes }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(cause) => {
                tracing::debug!(error = cause as &dyn Error, "failed to resolve object");
                StatusCode::NOT_FOUND
            }
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Unavailable => {
                tracing::warn!("rejecting download, worker pool is empty");
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Server(_) => {
                tracing::error!(error = &self as &dyn Error, "error handling request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Resolution failures are reported without details, whatever their cause.
        let body = match &self {
            ApiError::NotFound(_) => ApiErrorResponse {
                detail: Some(self.to_string()),
                causes: Vec::new(),
            },
            _ => ApiErrorResponse::from_error(&self),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RangeNotSatisfiable { size } = self {
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
        }

        response
    }
}
