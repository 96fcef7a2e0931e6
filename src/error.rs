//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`WorkerError`]: failures inside the transcription worker. They never
//!   escape the queue; the executor turns each one into an `error` status on
//!   the task that hit it.
//! - [`AppError`]: failures at the HTTP boundary, converted to JSON responses.
//!
//! ## JSON Response Format:
//! ```json
//! {
//!   "error": {
//!     "type": "not_found",
//!     "message": "No task for recording 'a.wav'",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;
use std::path::PathBuf;

/// Failures raised while resolving a model or running inference for one task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The resource gate refused a model load. Both values are bytes.
    InsufficientMemory { available: u64, required: u64 },

    /// The inference engine failed to start or run.
    Engine(String),

    /// The task's recording does not exist in storage.
    AudioFileNotFound(PathBuf),

    /// The file name would escape the recordings directory.
    InvalidFileName(String),

    /// Loading a model variant into a context failed.
    ModelLoad { variant: String, message: String },

    /// No variant with this id in the catalog.
    UnknownVariant(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::InsufficientMemory { available, required } => write!(
                f,
                "Not enough memory to load model: {} available, {} required",
                format_bytes(*available),
                format_bytes(*required)
            ),
            WorkerError::Engine(msg) => write!(f, "Inference engine error: {}", msg),
            WorkerError::AudioFileNotFound(path) => {
                write!(f, "Audio file not found: {}", path.display())
            }
            WorkerError::InvalidFileName(name) => write!(f, "Invalid audio file name: {}", name),
            WorkerError::ModelLoad { variant, message } => {
                write!(f, "Failed to load model '{}': {}", variant, message)
            }
            WorkerError::UnknownVariant(id) => write!(f, "Unknown model variant: {}", id),
        }
    }
}

impl std::error::Error for WorkerError {}

/// Human-readable byte count, e.g. `600.0 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const MB: f64 = 1024.0 * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else {
        format!("{:.1} MB", value / MB)
    }
}

/// Errors returned by HTTP handlers.
///
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Client mistakes map to 4xx, everything else to 500.
impl From<WorkerError> for AppError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::InvalidFileName(_) | WorkerError::UnknownVariant(_) => {
                AppError::BadRequest(err.to_string())
            }
            WorkerError::AudioFileNotFound(_) => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_memory_message_names_both_amounts() {
        let err = WorkerError::InsufficientMemory {
            available: 200 * 1024 * 1024,
            required: 600 * 1024 * 1024,
        };
        let message = err.to_string();
        assert!(message.contains("200.0 MB"));
        assert!(message.contains("600.0 MB"));
    }

    #[test]
    fn test_format_bytes_switches_to_gigabytes() {
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
        assert_eq!(format_bytes(512 * 1024 * 1024), "512.0 MB");
    }

    #[test]
    fn test_worker_error_status_mapping() {
        let not_found: AppError = WorkerError::AudioFileNotFound(PathBuf::from("x.wav")).into();
        assert_eq!(
            not_found.error_response().status(),
            actix_web::http::StatusCode::NOT_FOUND
        );

        let bad: AppError = WorkerError::InvalidFileName("../etc".to_string()).into();
        assert_eq!(
            bad.error_response().status(),
            actix_web::http::StatusCode::BAD_REQUEST
        );

        let internal: AppError = WorkerError::Engine("boom".to_string()).into();
        assert_eq!(
            internal.error_response().status(),
            actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
