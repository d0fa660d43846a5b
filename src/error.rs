//! HTTP error mapping shared by the proxy and the backend service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_protocol::ContentError;
use serde_json::json;

use crate::config::ConfigError;
use crate::handle::GenerationError;
use crate::supervisor::SupervisorError;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        match &err {
            ConfigError::UnknownSlot(_) => ApiError::not_found(err.to_string()),
            ConfigError::Io { .. } | ConfigError::Catalog { .. } => ApiError::internal(err.to_string()),
            _ => ApiError::bad_request(err.to_string()),
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        match &err {
            GenerationError::Busy => ApiError::conflict(err.to_string()),
            GenerationError::NotMultimodal => ApiError::bad_request(err.to_string()),
            GenerationError::Engine(_) | GenerationError::Spawn(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<ContentError> for ApiError {
    fn from(err: ContentError) -> Self {
        ApiError::bad_request(err.to_string())
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match &err {
            SupervisorError::UnknownSlot(_) | SupervisorError::NotRunning(_) => ApiError::not_found(err.to_string()),
            SupervisorError::MissingPort(_) | SupervisorError::Launch { .. } | SupervisorError::Signal { .. } => {
                ApiError::internal(err.to_string())
            }
        }
    }
}
