use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("no messages to process")]
    EmptyMessages,

    #[error("target not whitelisted")]
    NotWhitelisted { target: String },

    #[error("concurrency limit exceeded")]
    ConcurrencyLimit,

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream request failed")]
    UpstreamUnreachable(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::EmptyMessages => StatusCode::BAD_REQUEST,
            GatewayError::NotWhitelisted { .. } => StatusCode::FORBIDDEN,
            GatewayError::ConcurrencyLimit => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        }

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
