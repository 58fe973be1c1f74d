use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::messages::anthropic::ErrorResponse;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Gateway errors with their wire `error.type` and HTTP status.
///
/// Pool-wide quota exhaustion maps to 400 on purpose: clients treat 429/529
/// as retryable and would amplify the very quota problem that caused the
/// failure.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request failed validation, or the model is not allowed.
    #[error("{0}")]
    InvalidRequest(String),

    /// Every account is rate-limited for the requested model.
    #[error("All accounts are rate-limited for this model: {0}")]
    QuotaExhausted(String),

    /// No account could produce a usable access token.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Upstream returned PERMISSION_DENIED.
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Unknown path.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Token counting is not supported by this proxy.
    #[error("Token counting is not implemented")]
    NotImplemented,

    /// Every endpoint failed with a server error or was unreachable.
    #[error("Upstream unavailable: {0}")]
    Overloaded(String),

    /// Upstream returned an error body worth relaying, e.g. the local
    /// OpenAI-compatible endpoint failing.
    #[error("{message}")]
    Upstream {
        /// Status to relay.
        status: u16,
        /// Sanitized upstream message.
        message: String,
    },

    /// Internal failure whose details must not leak.
    #[error("Internal server error")]
    Internal,
}

impl GatewayError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::QuotaExhausted(_) => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Permission(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Self::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire `error.type` for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::QuotaExhausted(_) => "invalid_request_error",
            Self::Authentication(_) => "authentication_error",
            Self::Permission(_) => "permission_error",
            Self::NotFound(_) => "not_found_error",
            Self::NotImplemented => "not_implemented",
            Self::Overloaded(_) => "overloaded_error",
            Self::Upstream { .. } => "api_error",
            Self::Internal => "api_error",
        }
    }

    /// Message safe to expose to callers. Upstream auth failures never echo
    /// response bodies, which may contain tokens.
    pub fn client_message(&self) -> String {
        match self {
            Self::Authentication(_) => "Authentication with the upstream failed for all accounts".to_string(),
            Self::Internal => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(self.error_type(), self.client_message());

        (status, Json(body)).into_response()
    }
}
