//! Error types for onair-sync
//!
//! Defines the mirror/broadcast failure taxonomy using thiserror, plus the HTTP
//! mapping used by API handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for onair-sync
#[derive(Error, Debug)]
pub enum Error {
    /// A command attempt failed; counted against the command's attempt budget
    #[error("Transient execution error: {0}")]
    TransientExecution(String),

    /// A command exhausted its attempts and the mirror queue stopped
    #[error("Mirror queue exhausted after {attempts} attempts on command {command_id}: {reason}")]
    FatalQueueExhaustion {
        command_id: Uuid,
        attempts: u32,
        reason: String,
    },

    /// Tunnel or pool setup failed
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// Writing the fatal snapshot failed
    #[error("Failed to persist fatal snapshot to {path}: {message}")]
    PersistenceFailure { path: PathBuf, message: String },

    /// No registered client has this id
    #[error("Client not found: {0}")]
    ClientNotFound(Uuid),

    /// The client is registered but not subscribed to the topic
    #[error("Client {client_id} is not subscribed to topic '{topic}'")]
    ClientNotSubscribed { topic: String, client_id: Uuid },

    /// Writing to a client transport failed
    #[error("Client transport closed: {0}")]
    TransportClosed(String),

    /// The mirror queue is dead and no longer accepts commands
    #[error("Mirror queue is stopped")]
    QueueStopped,

    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shared library errors
    #[error(transparent)]
    Common(#[from] onair_common::Error),

    /// Background task failed to complete
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using onair-sync Error
pub type Result<T> = std::result::Result<T, Error>;

/// JSON error body returned by API handlers
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier
    pub error: String,
    /// Human-readable error message
    pub message: String,
}

impl Error {
    /// Stable identifier used in API error bodies
    pub fn code(&self) -> &'static str {
        match self {
            Error::TransientExecution(_) => "transient_execution",
            Error::FatalQueueExhaustion { .. } => "fatal_queue_exhaustion",
            Error::ConnectionUnavailable(_) => "connection_unavailable",
            Error::PersistenceFailure { .. } => "persistence_failure",
            Error::ClientNotFound(_) => "client_not_found",
            Error::ClientNotSubscribed { .. } => "client_not_subscribed",
            Error::TransportClosed(_) => "transport_closed",
            Error::QueueStopped => "queue_stopped",
            Error::Config(_) => "config",
            Error::Http(_) => "http",
            Error::Io(_) => "io",
            Error::Common(_) => "common",
            Error::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::ClientNotFound(_) => StatusCode::NOT_FOUND,
            Error::ClientNotSubscribed { .. } => StatusCode::CONFLICT,
            Error::QueueStopped | Error::ConnectionUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::TransportClosed(_) => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addressing_errors_map_to_client_statuses() {
        let id = Uuid::new_v4();
        assert_eq!(Error::ClientNotFound(id).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::ClientNotSubscribed {
                topic: "mirror".to_string(),
                client_id: id,
            }
            .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(Error::QueueStopped.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_persistence_failure_message_names_path() {
        let err = Error::PersistenceFailure {
            path: PathBuf::from("/var/lib/onair/fatal.json"),
            message: "disk full".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/var/lib/onair/fatal.json"));
        assert!(text.contains("disk full"));
        assert_eq!(err.code(), "persistence_failure");
    }
}
