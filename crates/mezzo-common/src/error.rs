//! Centralized error types for Mezzo.
//!
//! Uses `thiserror` for ergonomic error definitions and provides HTTP-friendly
//! conversions so the ops surface can return errors directly. The same type is
//! serialized into response-level `error` payloads on the signaling socket —
//! orchestrator handler failures never crash the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core error type used across all Mezzo services.
#[derive(Debug, thiserror::Error)]
pub enum MezzoError {
    // === Resource errors ===
    /// A referenced session/transport/producer/consumer id is unknown,
    /// or not owned by the requesting session.
    #[error("{resource} not found")]
    NotFound { resource: String },

    // === Media engine errors ===
    /// The media-routing engine rejected an operation.
    #[error("Engine error: {reason}")]
    Engine { reason: String },

    /// A consume request's client capabilities cannot be satisfied
    /// by the requested producer.
    #[error("Cannot consume: client capabilities do not match the producer")]
    CannotConsume,

    // === Bridge errors ===
    /// The transcoding pipeline failed to start or crashed.
    #[error("Bridge unavailable: {reason}")]
    BridgeUnavailable { reason: String },

    // === Request errors ===
    #[error("Validation failed: {message}")]
    Validation { message: String },

    // === Infrastructure errors ===
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl MezzoError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Map error to HTTP status code (ops surface).
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::CannotConsume | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::BridgeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Engine { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error code string for programmatic handling by clients.
    pub fn error_code(&self) -> &str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Engine { .. } => "ENGINE_ERROR",
            Self::CannotConsume => "CANNOT_CONSUME",
            Self::BridgeUnavailable { .. } => "BRIDGE_UNAVAILABLE",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body sent to HTTP clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    error: String,
    message: String,
}

impl IntoResponse for MezzoError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't leak internal details to clients
        let message = match &self {
            MezzoError::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.error_code().to_string(),
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using MezzoError.
pub type MezzoResult<T> = Result<T, MezzoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = MezzoError::not_found("producer");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(err.to_string(), "producer not found");
    }

    #[test]
    fn internal_detail_is_scrubbed() {
        let err = MezzoError::Internal(anyhow::anyhow!("secret db password"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }
}
