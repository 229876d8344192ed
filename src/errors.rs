use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no routable backends for {0}")]
    NoBackends(String),
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("challenge verification rejected: {0}")]
    CaptchaRejected(String),
    #[error("invalid challenge token: {0}")]
    InvalidToken(String),
    #[error("kv store error: {0}")]
    Kv(String),
    #[error("config storage error: {0}")]
    Storage(String),
    #[error("upstream {backend} unreachable: {message}")]
    Upstream { backend: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl ResponseError for GatewayError {
    fn error_response(&self) -> HttpResponse {
        let code = match self {
            GatewayError::NoBackends(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRequest(_) | GatewayError::CaptchaRejected(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::InvalidToken(_) => StatusCode::FORBIDDEN,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal faults keep their detail in the logs, not the body.
        let message = if code == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal gateway error");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorBody {
            error: self.name(),
            message,
        };
        HttpResponse::build(code).json(body)
    }
}

impl GatewayError {
    fn name(&self) -> &str {
        match self {
            GatewayError::NoBackends(_) => "no_backends",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::CaptchaRejected(_) => "captcha_rejected",
            GatewayError::InvalidToken(_) => "invalid_token",
            GatewayError::Kv(_) => "kv_error",
            GatewayError::Storage(_) => "storage_error",
            GatewayError::Upstream { .. } => "bad_gateway",
            GatewayError::Io(_) => "io_error",
            GatewayError::Any(_) => "internal_error",
        }
    }
}
