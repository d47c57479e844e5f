//! Error types for the core library.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur in core operations.
///
/// Pipeline-level failures (a provider that cannot authenticate, a lookup
/// that keeps failing) are not errors: they are recorded in the run summary.
/// This type covers the infrastructure around the pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL in configuration.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Run configuration failed validation.
    #[error("Invalid configuration: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    InvalidConfig(Vec<ConfigError>),

    /// Credential storage error.
    #[error("Credential error: {0}")]
    Credential(#[from] crate::credentials::CredentialError),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
