// Central Error Types for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Domain error: {0}")]
    Domain(#[from] crate::domain::DomainError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Storage actor is not running")]
    ActorStopped,

    #[error("Request aborted before it was processed")]
    Aborted,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

// From implementations for infra crates (to avoid circular dependency)
impl From<String> for AppError {
    fn from(err: String) -> Self {
        AppError::Database(err)
    }
}

/// Failure of a job or of a cache request built on top of jobs.
///
/// Kept `Clone` so that one failure can be stored in a [`JobHandle`] and
/// delivered to every caller waiting on the same cache key.
///
/// [`JobHandle`]: crate::application::worker::JobHandle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("job was aborted")]
    Aborted,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job failed: {0}")]
    Failed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Aborted | AppError::ActorStopped => JobError::Aborted,
            AppError::NotFound(what) => JobError::NotFound(what),
            AppError::Job(inner) => inner,
            AppError::Database(msg) => JobError::Store(msg),
            other => JobError::Failed(other.to_string()),
        }
    }
}
