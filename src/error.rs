//! Custom error types for asktrack.
//!
//! This module provides the error taxonomy of the tracking subsystem. The
//! variants are grouped by the stage of a poll that produced them so the
//! tracker can decide, per task, whether to retry on the next tick, flag
//! the task as stuck, or record a failure on the persisted aggregate.

use std::path::PathBuf;
use thiserror::Error;

use crate::task::TaskKind;

/// Main error type for asktrack operations
#[derive(Error, Debug)]
pub enum TrackerError {
    // =========================================================================
    // Remote Service Errors
    // =========================================================================
    /// Network failure or 5xx from the AI service. Retried on the next tick.
    #[error("Transient fetch error for {query_id}: {message}")]
    TransientFetch { query_id: String, message: String },

    /// The AI service rejected the request with a non-retriable 4xx status.
    #[error("AI service rejected {query_id} with HTTP {status}: {message}")]
    RemoteRejected {
        query_id: String,
        status: u16,
        message: String,
    },

    /// Submitting a new job to the AI service failed
    #[error("Failed to submit {kind} job: {message}")]
    Submit { kind: TaskKind, message: String },

    /// Cancelling a job on the AI service failed
    #[error("Failed to cancel {kind} job {query_id}: {message}")]
    Cancel {
        kind: TaskKind,
        query_id: String,
        message: String,
    },

    /// The AI service answered with a body we could not decode
    #[error("Malformed response for {query_id}: {message}")]
    MalformedResponse { query_id: String, message: String },

    // =========================================================================
    // Status Errors
    // =========================================================================
    /// A status string that does not belong to the kind's vocabulary
    #[error("Unknown {kind} status '{status}'")]
    UnknownStatus { kind: TaskKind, status: String },

    // =========================================================================
    // Post-processing Errors
    // =========================================================================
    /// Folding a finalized result into its aggregate failed
    #[error("Merge failed for task {task_id}: {message}")]
    Merge { task_id: String, message: String },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Persistence layer failure
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    /// Referenced record does not exist
    #[error("Record not found: {key}")]
    RecordNotFound { key: String },

    /// The record has moved on to another job since the write was issued
    #[error("Record {key} no longer belongs to {query_id}")]
    RecordSuperseded { key: String, query_id: String },

    /// Referenced task is not tracked
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// SQLite error wrapper
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// HTTP client error wrapper
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TrackerError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a transient fetch error
    pub fn transient(query_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientFetch {
            query_id: query_id.into(),
            message: message.into(),
        }
    }

    /// Create a merge error
    pub fn merge(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Merge {
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Create an unknown status error
    pub fn unknown_status(kind: TaskKind, status: impl Into<String>) -> Self {
        Self::UnknownStatus {
            kind,
            status: status.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if the next tick should simply try again.
    ///
    /// Every failure inside a poll is retried; this distinguishes failures
    /// that are expected to heal on their own from ones that need a human.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientFetch { .. }
                | Self::Http(_)
                | Self::Persistence { .. }
                | Self::Sqlite(_)
                | Self::Io(_)
        )
    }

    /// Check if this failure will not heal by retrying.
    ///
    /// Tasks hitting one of these are flagged stuck immediately.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::RemoteRejected { .. } | Self::UnknownStatus { .. }
        )
    }

    /// Stable error code persisted next to failures
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TransientFetch { .. } | Self::Http(_) => "TRANSIENT_FETCH_ERROR",
            Self::RemoteRejected { .. } => "REMOTE_REJECTED",
            Self::Submit { .. } => "SUBMIT_ERROR",
            Self::Cancel { .. } => "CANCEL_ERROR",
            Self::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            Self::UnknownStatus { .. } => "UNKNOWN_STATUS",
            Self::Merge { .. } => "MERGE_ERROR",
            Self::Persistence { .. } | Self::Sqlite(_) => "PERSISTENCE_ERROR",
            Self::RecordNotFound { .. } => "RECORD_NOT_FOUND",
            Self::RecordSuperseded { .. } => "RECORD_SUPERSEDED",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::Config { .. } | Self::InvalidConfig { .. } => "CONFIG_ERROR",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            Self::Persistence { .. } | Self::Sqlite(_) => 6,
            Self::Submit { .. } | Self::RemoteRejected { .. } => 3,
            _ => 1,
        }
    }
}

/// Type alias for asktrack results
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Extension trait for converting foreign errors to TrackerError
pub trait IntoTrackerError<T> {
    fn into_persistence(self) -> Result<T>;
    fn into_config(self) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoTrackerError<T> for std::result::Result<T, E> {
    fn into_persistence(self) -> Result<T> {
        self.map_err(|e| TrackerError::persistence(e.into().to_string()))
    }

    fn into_config(self) -> Result<T> {
        self.map_err(|e| TrackerError::config(e.into().to_string()))
    }
}
