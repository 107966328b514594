//! HTTP error mapping for engine errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::EngineError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Engine(e) => match e {
                EngineError::Validation(_) | EngineError::WorkerRegistration { .. } => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
                EngineError::AlreadyExecuted(_)
                | EngineError::WorkflowCancelled(_)
                | EngineError::DuplicateWorkflow(_) => StatusCode::CONFLICT,
                EngineError::EngineOverload { .. } => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Config(_) | EngineError::Io(_) | EngineError::Json(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16()
        }));
        (status, body).into_response()
    }
}
