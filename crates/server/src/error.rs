use mllm_shap_core::CoreError;
use rocket::{
    Request,
    http::Status,
    response::{Responder, status::Custom},
    serde::json::Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::LoadInProgress(_) => ApiError::Conflict(err.to_string()),
            err if err.is_client_error() => ApiError::BadRequest(err.to_string()),
            err => ApiError::Internal(err.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    r#type: String,
}

impl ErrorBody {
    fn new(message: impl Into<String>, error_type: &str) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                r#type: error_type.to_string(),
            },
        }
    }
}

impl ApiError {
    fn status(&self) -> (Status, &'static str) {
        match self {
            ApiError::BadRequest(_) => (Status::BadRequest, "invalid_request_error"),
            ApiError::NotFound(_) => (Status::NotFound, "not_found_error"),
            ApiError::Conflict(_) => (Status::Conflict, "conflict_error"),
            ApiError::Internal(_) => (Status::InternalServerError, "internal_error"),
        }
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> rocket::response::Result<'static> {
        let (status, error_type) = self.status();
        if status == Status::InternalServerError {
            error!(uri = %request.uri(), error = %self, "Request failed");
        }
        Custom(status, Json(ErrorBody::new(self.to_string(), error_type))).respond_to(request)
    }
}

/// Errors Rocket raises before a handler runs (bad JSON, unknown routes, oversized uploads).
#[catch(default)]
pub fn default_catcher(status: Status, _request: &Request<'_>) -> Custom<Json<ErrorBody>> {
    let error_type = match status.code {
        404 => "not_found_error",
        400..=499 => "invalid_request_error",
        _ => "internal_error",
    };
    let message = status.reason().unwrap_or("request failed");
    Custom(status, Json(ErrorBody::new(message, error_type)))
}
