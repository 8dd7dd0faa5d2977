use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Bad submission input, rejected at the API boundary.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The pluggable handler reported a processing failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Raised from a progress checkpoint once cancellation was requested.
    #[error("Job cancelled")]
    Cancelled,

    #[error("Job timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Processor is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    /// Shorthand used by handlers to report a domain failure.
    pub fn handler(message: impl Into<String>) -> Self {
        JobError::Handler(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
