use crate::credentials::CredentialError;
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub const COPILOT_SETTINGS_URL: &str = "https://github.com/settings/copilot";

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn invalid_api_key() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Invalid or missing API Key",
        )
        .with_type("authentication_error")
    }

    pub fn model_not_enabled(model: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "model_not_enabled",
            format!(
                "Model '{model}' is not enabled or requires policy acceptance. \
                 Check Copilot settings at {COPILOT_SETTINGS_URL}"
            ),
        )
        .with_type("permission_error")
    }
}

impl From<CredentialError> for AppError {
    fn from(err: CredentialError) -> Self {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "credential_unavailable",
            err.to_string(),
        )
        .with_type("server_error")
    }
}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        match err.kind {
            UpstreamErrorKind::Network => AppError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unreachable",
                err.message,
            )
            .with_type("upstream_error"),
            UpstreamErrorKind::Http => AppError::new(
                err.status.unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream_error",
                err.message,
            )
            .with_type("upstream_error"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    detail: String,
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            detail: self.message.clone(),
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type,
                code: self.code,
            },
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
