//! HTTP-facing error taxonomy for the passthrough path
//!
//! Every branch of the passthrough route ends in a [`GatewayError`] or a
//! relayed agent reply; nothing is left for the transport layer to handle.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

const OFFLINE_MESSAGE: &str = "User Hardware is currently offline or disconnected.";

/// JSON error body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_ip: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: None,
            detected_ip: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("User not found")]
    UserNotFound,

    #[error("Client ID not found")]
    ClientNotFound,

    #[error("Invalid API Key")]
    InvalidApiKey,

    #[error("Access Denied: IP not whitelisted")]
    Forbidden { detected_ip: String },

    #[error("Bad Request")]
    BadRequest(String),

    #[error("Payload Too Large")]
    PayloadTooLarge,

    /// No open session for the addressed identity
    #[error("Bad Gateway")]
    Offline,

    /// The session went away or answered with something unusable
    #[error("Bad Gateway")]
    BadGateway(String),

    #[error("Gateway Timeout: Hardware did not respond in time.")]
    Timeout,

    #[error("Too Many Requests")]
    RateLimited { retry_after_secs: u64 },

    #[error("Internal error")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UserNotFound | GatewayError::ClientNotFound => StatusCode::NOT_FOUND,
            GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden { .. } => StatusCode::FORBIDDEN,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Offline | GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorResponse {
        let body = ErrorResponse::new(self.to_string());
        match self {
            GatewayError::Forbidden { detected_ip } => ErrorResponse {
                detected_ip: Some(detected_ip.clone()),
                ..body
            },
            GatewayError::BadRequest(message) | GatewayError::BadGateway(message) => {
                body.with_message(message.clone())
            }
            GatewayError::Offline => body.with_message(OFFLINE_MESSAGE),
            GatewayError::RateLimited { .. } => {
                body.with_message("Rate limit exceeded, retry later.")
            }
            _ => body,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Internal(detail) = &self {
            error!(error = %detail, "Passthrough failed internally");
        }

        let mut response = (self.status(), Json(self.body())).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
