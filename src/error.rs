//! Error types for fedcore
//!
//! All errors in the crate are converted to `AppError`,
//! which implements `IntoResponse` for proper HTTP error responses.
//!
//! Soft federation failures (an actor that cannot be resolved, an Accept
//! with no pending follow) are not errors: they surface as `None` or a
//! `false` no-op from the component that observed them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Federation error (502)
    #[error("Federation error: {0}")]
    Federation(String),

    /// A single signed delivery was refused or never reached the remote inbox (502)
    #[error("Delivery to {inbox} failed: {reason}")]
    Delivery { inbox: String, reason: String },

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key generation/encoding error (500)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Wrapped private key could not be recovered: wrong secret or corrupted input (500)
    #[error("Failed to unwrap private key")]
    KeyUnwrap,

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl AppError {
    /// Metric label for this error
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Unauthorized => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::Validation(_) => "validation",
            AppError::Database(_) => "database",
            AppError::Federation(_) => "federation",
            AppError::Delivery { .. } => "delivery",
            AppError::InvalidSignature => "invalid_signature",
            AppError::Config(_) => "config",
            AppError::Encryption(_) => "encryption",
            AppError::KeyUnwrap => "key_unwrap",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Crypto and storage failures are reported as a generic server error;
    /// the underlying detail only goes to the log.
    fn into_response(self) -> Response {
        use axum::Json;

        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized | AppError::InvalidSignature => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Federation(_) | AppError::Delivery { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::Encryption(_)
            | AppError::KeyUnwrap
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_failures_map_to_generic_server_error() {
        let response = AppError::KeyUnwrap.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn delivery_failure_maps_to_bad_gateway() {
        let response = AppError::Delivery {
            inbox: "https://remote.example/inbox".to_string(),
            reason: "HTTP 500".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn invalid_signature_maps_to_unauthorized() {
        let response = AppError::InvalidSignature.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
