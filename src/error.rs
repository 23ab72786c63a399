//! Error types for inbox-tasks.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No mail credentials available: {0}")]
    MissingCredentials(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// True for uniqueness / constraint violations (duplicate external id).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Errors from the upstream mailbox (history sync, message retrieval, auth).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Mail provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Mail provider {provider} returned HTTP {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed for {provider}: {reason}")]
    AuthFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("History marker {marker} is no longer valid")]
    MarkerExpired { marker: String },
}

/// Classifier call failures. All variants are treated as transient by the queue.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Classifier rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid classification input: {0}")]
    InvalidInput(String),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Classification failed for {failed} of {batch} messages: {first}")]
    BatchClassification {
        failed: usize,
        batch: usize,
        first: ClassifyError,
    },

    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    #[error("Bulk save failed: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
