use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided, or the supplied credential was rejected
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// A locally-signed token failed verification (bad signature, expired, malformed)
    #[error("unauthorized token")]
    UnauthorizedToken,

    /// Every principal getter came back empty-handed
    #[error("could not find valid principal")]
    NoPrincipal,

    /// The token verified but its claims could not be projected into a principal
    #[error("{message}")]
    Claims { message: String },

    /// Malformed or missing protocol parameters, state mismatch, bad request bodies
    #[error("{message}")]
    BadRequest { message: String },

    /// The identity provider was unreachable or rejected a request
    #[error("identity provider error during {operation}")]
    Upstream { operation: String },

    /// Startup-time misconfiguration; never surfaced per request
    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// JSON body written for every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: u16,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } | Error::UnauthorizedToken | Error::NoPrincipal | Error::Claims { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Upstream { .. } | Error::Configuration { .. } | Error::Internal { .. } | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::UnauthorizedToken => "unauthorized token".to_string(),
            Error::NoPrincipal => "could not find valid principal".to_string(),
            Error::Claims { message } => message.clone(),
            Error::BadRequest { message } => message.clone(),
            Error::Upstream { .. } => "identity provider request failed".to_string(),
            Error::Configuration { .. } | Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Upstream { .. } | Error::Configuration { .. } | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Unauthenticated { .. } | Error::UnauthorizedToken | Error::NoPrincipal | Error::Claims { .. } => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::BadRequest { .. } => {
                tracing::info!("Client error: {}", self);
            }
        }

        json_error(self.status_code(), self.user_message())
    }
}

/// Build the JSON error response shared by every endpoint.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        message: message.into(),
        code: status.as_u16(),
    };

    let mut response = (status, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
