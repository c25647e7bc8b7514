use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Transfer error: {0}")]
    Transfer(#[from] crate::transfer::TransferError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::Transfer(e) => e.kind(),
            ApiError::Session(e) => e.kind(),
            ApiError::Config(_) => "blocked",
            ApiError::InvalidRequest(_) => "protocol",
            ApiError::NotFound(_) => "not_found",
        }
    }

    fn status(&self) -> StatusCode {
        match self.kind() {
            "not_found" => StatusCode::NOT_FOUND,
            "invalid_state" | "already_exists" => StatusCode::CONFLICT,
            "limit_exceeded" => StatusCode::TOO_MANY_REQUESTS,
            "blocked" | "unauthorized" => StatusCode::FORBIDDEN,
            "integrity" => StatusCode::UNPROCESSABLE_ENTITY,
            "timeout" => StatusCode::REQUEST_TIMEOUT,
            "protocol" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
