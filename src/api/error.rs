use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::gateway::CorrelationError;

/// API error types that can be returned from handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),

    #[error("Charge point rejected the call: {0}")]
    RemoteError(String),
}

/// Error response that gets serialized to JSON
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::RemoteError(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error type string
    fn error_type(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::ValidationError(_) => "ValidationError",
            ApiError::Unauthorized => "Unauthorized",
            ApiError::InternalError(_) => "InternalServerError",
            ApiError::ServiceUnavailable(_) => "ServiceUnavailable",
            ApiError::GatewayTimeout(_) => "GatewayTimeout",
            ApiError::RemoteError(_) => "RemoteError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_type = self.error_type();

        let message = match &self {
            ApiError::InternalError(_) => {
                tracing::error!(error = %self, "API error occurred");
                "An internal error occurred".to_string()
            }
            ApiError::ServiceUnavailable(_) => {
                tracing::warn!(error = %self, "Service unavailable");
                "Service temporarily unavailable".to_string()
            }
            _ => {
                tracing::debug!(error = %self, "Client error");
                self.to_string()
            }
        };

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            details: None,
        };

        (status, Json(error_response)).into_response()
    }
}

// Conversion from common error types

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::InternalError(error.to_string())
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ApiError::ValidationError(errors.to_string())
    }
}

impl From<CorrelationError> for ApiError {
    fn from(error: CorrelationError) -> Self {
        match error {
            CorrelationError::Timeout { .. } => ApiError::GatewayTimeout(error.to_string()),
            CorrelationError::Remote { .. } => ApiError::RemoteError(error.to_string()),
            CorrelationError::NotConnected(id) => {
                ApiError::NotFound(format!("charge point {id} is not connected"))
            }
            CorrelationError::ConnectionClosed | CorrelationError::Send(_) => {
                ApiError::ServiceUnavailable(error.to_string())
            }
            CorrelationError::Conversion(e) => ApiError::BadRequest(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::BadRequest("test".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::InternalError("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_types() {
        assert_eq!(
            ApiError::NotFound("test".to_string()).error_type(),
            "NotFound"
        );
        assert_eq!(
            ApiError::BadRequest("test".to_string()).error_type(),
            "BadRequest"
        );
        assert_eq!(ApiError::Unauthorized.error_type(), "Unauthorized");
    }

    #[test]
    fn test_correlation_errors_map_to_status() {
        let timeout = CorrelationError::Timeout {
            action: "GetConfiguration".into(),
            timeout: std::time::Duration::from_secs(30),
        };
        assert_eq!(ApiError::from(timeout).status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ApiError::from(CorrelationError::NotConnected("CP-1".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        let remote = CorrelationError::Remote {
            code: crate::ocpp::ErrorCode::NotSupported,
            description: "no".into(),
            details: serde_json::json!({}),
        };
        assert_eq!(ApiError::from(remote).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            ApiError::from(CorrelationError::ConnectionClosed).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_remote_error_body_names_relayed_code() {
        let remote = CorrelationError::Remote {
            code: crate::ocpp::ErrorCode::Other("VendorBusy".into()),
            description: "try later".into(),
            details: serde_json::json!({}),
        };
        let response = ApiError::from(remote).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"], "RemoteError");
        assert!(body["message"].as_str().unwrap().contains("VendorBusy: try later"));
    }

    #[test]
    fn test_error_display() {
        let error = ApiError::NotFound("connection CP-7".to_string());
        assert_eq!(error.to_string(), "Resource not found: connection CP-7");
    }
}
