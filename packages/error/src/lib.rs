use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequestError,
    AuthenticationError,
    NotFoundError,
    ApiError,
    OverloadedError,
}

impl ErrorType {
    /// Wire string used in the Anthropic-style error body.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequestError => "invalid_request_error",
            Self::AuthenticationError => "authentication_error",
            Self::NotFoundError => "not_found_error",
            Self::ApiError => "api_error",
            Self::OverloadedError => "overloaded_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequestError => 400,
            Self::AuthenticationError => 401,
            Self::NotFoundError => 404,
            Self::ApiError => 500,
            Self::OverloadedError => 529,
        }
    }
}

/// Anthropic-style error envelope: `{"type":"error","error":{"type":…,"message":…}}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub type_: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub type_: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            type_: "error".to_string(),
            error: ErrorDetail {
                type_: error_type.as_str().to_string(),
                message: message.into(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("failed to spawn assistant process: {message}")]
    SpawnFailed { message: String },
    #[error("assistant process produced no parseable result")]
    NoResult,
    #[error("session store error: {message}")]
    SessionStore { message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequestError,
            Self::Unauthorized { .. } => ErrorType::AuthenticationError,
            Self::NotFound { .. } => ErrorType::NotFoundError,
            Self::SpawnFailed { .. }
            | Self::NoResult
            | Self::SessionStore { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal { .. } => ErrorType::ApiError,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody::new(self.error_type(), self.to_string())
    }
}
