use crate::store::StoreError;
use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

/// Error body shared by every API endpoint:
/// `{"result": "error", "error": "<message>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not Authenticated")
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::Invalid(_) | StoreError::EncryptionDisabled(_) => StatusCode::BAD_REQUEST,
            StoreError::Decrypt(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Load { .. } | StoreError::Persist { .. } | StoreError::Unavailable => {
                error!(error = %e, "profile store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self::new(status, e.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::UNAUTHORIZED {
            return (self.status, Json(json!({ "error": self.message }))).into_response();
        }

        (
            self.status,
            Json(json!({ "result": "error", "error": self.message })),
        )
            .into_response()
    }
}
