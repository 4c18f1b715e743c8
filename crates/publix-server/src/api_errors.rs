//! HTTP error mapping for publix handlers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use publix_runtime::{ErrorKind, PublixError};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(ErrorState),
    Forbidden(ErrorState),
    NotFound(ErrorState),
    UnsupportedMediaType(ErrorState),
    Internal(ErrorState),
}

#[derive(Clone, Debug)]
pub struct ErrorState {
    pub message: String,
    pub code: Option<&'static str>,
    pub request_id: Option<String>,
    pub details: Option<Value>,
}

impl ErrorState {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            request_id: None,
            details: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct ErrorEnvelope {
    request_id: String,
    error: ErrorBody,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(ErrorState::new(message))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(ErrorState::new(message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(ErrorState::new(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(ErrorState::new(message))
    }

    fn state_mut(&mut self) -> &mut ErrorState {
        match self {
            Self::BadRequest(s)
            | Self::Forbidden(s)
            | Self::NotFound(s)
            | Self::UnsupportedMediaType(s)
            | Self::Internal(s) => s,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.state_mut().request_id = Some(request_id.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.state_mut().details = Some(details);
        self
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.state_mut().code = Some(code);
        self
    }
}

impl From<PublixError> for ApiError {
    fn from(err: PublixError) -> Self {
        let code = err.code();
        let message = err.to_string();
        let api = match err.kind() {
            ErrorKind::BadRequest => Self::bad_request(message),
            ErrorKind::Forbidden => Self::forbidden(message),
            ErrorKind::NotFound => Self::not_found(message),
            ErrorKind::UnsupportedMediaType => {
                Self::UnsupportedMediaType(ErrorState::new(message))
            }
            ErrorKind::InternalServerError => Self::internal(message),
        };
        let api = match &err {
            PublixError::PayloadTooLarge { size, limit } => {
                api.with_details(serde_json::json!({ "size": size, "limit": limit }))
            }
            PublixError::FileTooLarge { size, limit } => {
                api.with_details(serde_json::json!({ "size": size, "limit": limit }))
            }
            PublixError::QuotaExceeded { used, limit } => {
                api.with_details(serde_json::json!({ "used": used, "limit": limit }))
            }
            _ => api,
        };
        api.with_code(code)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, default_code, state) = match self {
            Self::BadRequest(s) => (StatusCode::BAD_REQUEST, "invalid_argument", s),
            Self::Forbidden(s) => (StatusCode::FORBIDDEN, "forbidden", s),
            Self::NotFound(s) => (StatusCode::NOT_FOUND, "not_found", s),
            Self::UnsupportedMediaType(s) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_media_type",
                s,
            ),
            Self::Internal(s) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", s),
        };
        let request_id = state
            .request_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let body = ErrorEnvelope {
            request_id,
            error: ErrorBody {
                code: state.code.unwrap_or(default_code),
                message: state.message,
                details: state.details,
            },
        };
        (status, Json(body)).into_response()
    }
}
