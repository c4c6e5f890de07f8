//! Error types for the chat service

use thiserror::Error;

use crate::orchestrator::JobState;

/// Main error type for job, model and store operations
#[derive(Error, Debug)]
pub enum FriendError {
    // ─────────────────────────────────────────────────────────────────────
    // Caller-facing errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch errors (recorded on the job as Failed)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Generation interrupted: {0}")]
    Cancelled(String),

    // ─────────────────────────────────────────────────────────────────────
    // Internal errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for FriendError {
    fn from(err: rusqlite::Error) -> Self {
        FriendError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for FriendError {
    fn from(err: serde_json::Error) -> Self {
        FriendError::Store(format!("serialization: {}", err))
    }
}

impl From<tokio::task::JoinError> for FriendError {
    fn from(err: tokio::task::JoinError) -> Self {
        FriendError::Store(format!("blocking task failed: {}", err))
    }
}

/// Result type alias for chat service operations
pub type Result<T> = std::result::Result<T, FriendError>;
