use crate::commands::UploadProgress;
use crate::uploader::events::{EventSender, ProgressEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid webhook URL: {url}")]
    InvalidWebhook { url: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid file type: {path}. Only image files are supported.")]
    InvalidFileType { path: String },

    #[error("Metadata parsing error: {0}")]
    MetadataParsing(String),

    #[error("Compression could not fit {path} into the byte budget")]
    CompressionExhausted { path: String },

    #[error("No {format} quality level fits the byte budget")]
    FormatExhausted { format: String },

    #[error("Endpoint rejected the request with status {status}: {detail}")]
    EndpointRejected { status: u16, detail: String },

    #[error("Rate limit exceeded. Retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Forum thread creation failed: {message}")]
    ThreadCreationFailed { message: String },

    #[error("Upload cancelled during {phase}")]
    UploadCancelled { phase: String },

    #[error("Upload session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("Upload session {session_id} is already {status}")]
    SessionTerminal { session_id: String, status: String },

    #[error("Upload session {session_id} is still processing")]
    SessionBusy { session_id: String },

    #[error("Destination {id} not found")]
    DestinationNotFound { id: i64 },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::FileNotFound {
            path: path.to_string(),
        }
    }

    pub fn invalid_file_type(path: &str) -> Self {
        Self::InvalidFileType {
            path: path.to_string(),
        }
    }

    pub fn invalid_webhook(url: &str) -> Self {
        Self::InvalidWebhook {
            url: url.to_string(),
        }
    }

    pub fn compression_exhausted(path: &str) -> Self {
        Self::CompressionExhausted {
            path: path.to_string(),
        }
    }

    pub fn rejected(status: u16, detail: &str) -> Self {
        Self::EndpointRejected {
            status,
            detail: detail.to_string(),
        }
    }

    pub fn thread_creation_failed(message: &str) -> Self {
        Self::ThreadCreationFailed {
            message: message.to_string(),
        }
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn cancelled(phase: &str) -> Self {
        Self::UploadCancelled {
            phase: phase.to_string(),
        }
    }

    pub fn session_terminal(session_id: &str, status: &str) -> Self {
        Self::SessionTerminal {
            session_id: session_id.to_string(),
            status: status.to_string(),
        }
    }

    /// HTTP status carried by an endpoint rejection, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::EndpointRejected { status, .. } => Some(*status),
            AppError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Network(_)
                | AppError::RateLimited { .. }
                | AppError::TransientNetwork(_)
                | AppError::ThreadCreationFailed { .. }
                | AppError::Io(_)
        ) || matches!(self, AppError::EndpointRejected { status, .. } if *status == 400 || *status == 413)
    }
}

/// Progress state type
pub type ProgressState = Arc<Mutex<HashMap<String, UploadProgress>>>;

/// Safe progress state update
pub fn safe_progress_update<F>(
    progress_state: &ProgressState,
    session_id: &str,
    operation: &str,
    f: F,
) -> bool
where
    F: FnOnce(&mut UploadProgress),
{
    match progress_state.lock() {
        Ok(mut progress) => {
            if let Some(session_progress) = progress.get_mut(session_id) {
                f(session_progress);
                true
            } else {
                log::warn!(
                    "Session {} not found for {} operation",
                    session_id,
                    operation
                );
                false
            }
        }
        Err(e) => {
            log::error!(
                "Failed to acquire progress lock for {} in session {} (non-critical): {}",
                operation,
                session_id,
                e
            );
            false
        }
    }
}

pub fn safe_progress_read<F, R>(
    progress_state: &ProgressState,
    session_id: &str,
    operation: &str,
    f: F,
) -> Option<R>
where
    F: FnOnce(&UploadProgress) -> R,
{
    match progress_state.lock() {
        Ok(progress) => progress.get(session_id).map(f),
        Err(e) => {
            log::error!(
                "Failed to acquire progress lock for {} in session {} (non-critical): {}",
                operation,
                session_id,
                e
            );
            None
        }
    }
}

/// Emit a progress event; a channel without subscribers is not an error
pub fn safe_emit_event(events: &EventSender, event: ProgressEvent) -> bool {
    match events.send(event) {
        Ok(receivers) => {
            log::trace!("Emitted progress event to {} receiver(s)", receivers);
            true
        }
        Err(e) => {
            log::debug!(
                "No subscribers for progress event {:?} (non-critical)",
                e.0.phase
            );
            false
        }
    }
}
