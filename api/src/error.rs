use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Failures of the record backends. Every variant except `InvalidUserId` means
/// the store could not be reached or read back.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),

    #[error("store unavailable: unreadable record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, StoreError::InvalidUserId(_))
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("API key required")]
    MissingApiKey,

    #[error("request to model endpoint failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Anthropic API error: {0}")]
    Upstream(reqwest::StatusCode),

    #[error("Could not parse AI response")]
    UnparseableReply,
}

/// Everything a handler can fail with. Rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Endpoint not found")]
    NotFound,

    #[error("{message}")]
    Store {
        message: &'static str,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ApiError {
    /// Wraps a store failure with the generic message shown to clients and logs
    /// the underlying cause.
    pub fn store(message: &'static str, source: StoreError) -> Self {
        tracing::error!("{}: {}", message.to_lowercase(), source);
        ApiError::Store { message, source }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::warn!("rejected request body: {}", rejection.body_text());
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Store {
                source: StoreError::InvalidUserId(_),
                ..
            } => StatusCode::BAD_REQUEST,
            ApiError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Relay(RelayError::MissingApiKey) => StatusCode::UNAUTHORIZED,
            ApiError::Relay(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            ApiError::Store {
                source: StoreError::InvalidUserId(_),
                ..
            } => "Invalid user id".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
