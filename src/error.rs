use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Failure talking to one of the external services
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection, timeout or body transfer failure
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The service answered with a non-success status
    #[error("{service} returned HTTP {status}: {message}")]
    Api {
        service: &'static str,
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// The service answered 2xx but the body was not what we expected
    #[error("Unexpected response from {service}: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
    /// Credentials could not be turned into a signed request or token
    #[error("Authentication failed: {0}")]
    Auth(String),
}

impl ServiceError {
    /// Whether a retry of an idempotent call could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ServiceError::Api { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Decode { .. } | ServiceError::Auth(_) => false,
        }
    }

    /// HTTP status reported by the service, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Api { status, .. } => Some(*status),
            ServiceError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Service specific error code (e.g. `ResourceAlreadyExistsException`, `ALREADY_EXISTS`)
    pub fn code(&self) -> Option<&str> {
        match self {
            ServiceError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Key the error text is reported under in the JSON body
#[derive(Debug, Clone, Copy, PartialEq)]
enum BodyKey {
    Error,
    Message,
}

/// Error returned by HTTP handlers
///
/// Face endpoints report `{"message": ...}`, everything else `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    key: BodyKey,
    text: String,
}

impl ApiError {
    pub fn bad_request(text: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            key: BodyKey::Error,
            text: text.into(),
        }
    }

    pub fn internal(text: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            key: BodyKey::Error,
            text: text.into(),
        }
    }

    /// Report under `message` instead of `error`
    pub fn as_message(mut self) -> Self {
        self.key = BodyKey::Message;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.key {
            BodyKey::Error => serde_json::json!({ "error": self.text }),
            BodyKey::Message => serde_json::json!({ "message": self.text }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::internal(err.to_string())
    }
}
