//! # Error Handling
//!
//! Two error families live here:
//!
//! - **`RelayError`**: the conversation domain errors. Every failure that can happen
//!   while relaying a message (bad input, backend failures, timeouts, missing
//!   connections) is one variant of this enum. The pipeline converts them into short,
//!   user-visible text frames with [`RelayError::user_message`]; the full error chain
//!   (including the backend cause) only ever goes to the logs.
//! - **`AppError`**: errors returned by HTTP handlers, converted into JSON responses
//!   through actix-web's `ResponseError` trait.
//!
//! ## Key Rust Concepts:
//! - **thiserror**: derives `Display` and `std::error::Error` from `#[error(...)]` attributes
//! - **`#[source]`**: links a wrapped cause so `Error::source()` walks the chain
//! - **ResponseError trait**: converts errors to HTTP responses

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Boxed cause carried by backend failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which backend call a timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generation,
    Synthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Generation => write!(f, "Text generation"),
            Stage::Synthesis => write!(f, "Speech synthesis"),
        }
    }
}

/// Errors produced while relaying a conversation turn.
///
/// ## Error Categories:
/// - **InvalidInput**: the submitted text was empty or whitespace only
/// - **Generation / Synthesis**: a backend call failed; the cause is kept for logging
/// - **Timeout**: a backend call did not answer within the configured budget
/// - **NoActiveConnection**: a send targeted an id the registry does not know
/// - **UnrecognizedSignal / InvalidFrame**: the client sent something we can't route
/// - **QueueFull**: the optional pending-queue bound was reached
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Text generation failed: {message}")]
    Generation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Speech synthesis failed: {message}")]
    Synthesis {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: Stage, seconds: u64 },

    #[error("No active connection for client {0}")]
    NoActiveConnection(String),

    #[error("Unknown message type: {0}")]
    UnrecognizedSignal(String),

    #[error("Invalid message format: {0}")]
    InvalidFrame(String),

    #[error("Pending queue is full (limit {limit})")]
    QueueFull { limit: usize },
}

impl RelayError {
    /// Generation failure without an underlying error value.
    pub fn generation(message: impl Into<String>) -> Self {
        RelayError::Generation {
            message: message.into(),
            source: None,
        }
    }

    /// Generation failure wrapping the backend's own error.
    pub fn generation_caused_by(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RelayError::Generation {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Synthesis failure without an underlying error value.
    pub fn synthesis(message: impl Into<String>) -> Self {
        RelayError::Synthesis {
            message: message.into(),
            source: None,
        }
    }

    /// Synthesis failure wrapping the backend's own error.
    pub fn synthesis_caused_by(
        message: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RelayError::Synthesis {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    /// Machine-readable kind, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidInput(_) => "invalid_input",
            RelayError::Generation { .. } => "generation_error",
            RelayError::Synthesis { .. } => "synthesis_error",
            RelayError::Timeout { .. } => "timeout",
            RelayError::NoActiveConnection(_) => "no_active_connection",
            RelayError::UnrecognizedSignal(_) => "unrecognized_signal",
            RelayError::InvalidFrame(_) => "invalid_frame",
            RelayError::QueueFull { .. } => "queue_full",
        }
    }

    /// Text sent to the client when this error ends (or rejects) a message.
    ///
    /// Backend messages and causes stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            RelayError::InvalidInput(msg) => msg.clone(),
            RelayError::Generation { .. } => "Text generation failed".to_string(),
            RelayError::Synthesis { .. } => "Speech synthesis failed".to_string(),
            RelayError::Timeout { stage, .. } => format!("{} timed out", stage),
            RelayError::NoActiveConnection(id) => format!("No active connection for client {}", id),
            RelayError::UnrecognizedSignal(kind) => format!("Unknown message type: {}", kind),
            RelayError::InvalidFrame(_) => "Invalid message format".to_string(),
            RelayError::QueueFull { limit } => format!(
                "Too many pending messages (limit {}). Please wait until current audio finishes.",
                limit
            ),
        }
    }
}

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500 (Internal Server Error)
/// - NotFound → 404 (Not Found)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Requested resource was not found
    NotFound(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

/// JSON error responses.
///
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Interface load failed: index.html",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::NotFound(msg) => ("not_found", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
