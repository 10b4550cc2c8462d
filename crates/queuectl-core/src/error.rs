use thiserror::Error;

/// Errors surfaced by the job lifecycle engine.
///
/// Variants map 1:1 onto the error taxonomy: validation and conflict errors
/// are local to the caller and never mutate state; `Store` wraps anything
/// the persistence layer could not complete.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
