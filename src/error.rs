//! Gateway error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::runtime::RuntimeState;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad webhook secret or a caller that is not the admin.
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed update payload or a missing required field.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Runtime not started yet, or already stopped.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The Telegram Bot API call failed.
    #[error("Upstream API error: {0}")]
    UpstreamApi(String),

    /// A command handler failed while processing an update.
    #[error("Handler for /{command} failed: {message}")]
    Handler { command: String, message: String },

    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    #[error("Invalid runtime transition from {from:?} to {to:?}")]
    InvalidTransition { from: RuntimeState, to: RuntimeState },
}

impl GatewayError {
    pub fn not_initialized() -> Self {
        Self::ServiceUnavailable("Bot not initialized".to_string())
    }

    pub fn not_running() -> Self {
        Self::ServiceUnavailable("Bot not running".to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamApi(_)
            | Self::Handler { .. }
            | Self::DuplicateCommand(_)
            | Self::InvalidTransition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::UpstreamApi(_) => "UPSTREAM_API_ERROR",
            Self::Handler { .. } => "HANDLER_ERROR",
            Self::DuplicateCommand(_) | Self::InvalidTransition { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<teloxide::RequestError> for GatewayError {
    fn from(err: teloxide::RequestError) -> Self {
        Self::UpstreamApi(err.to_string())
    }
}

/// JSON body returned for every gateway error.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        });
        (self.status(), body).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
