//! Error types for twinrun

use thiserror::Error;

/// Result type alias using the harness Error
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types.
///
/// Invocation failures (a CLI or SSH command exiting non-zero) are never
/// represented here; they are data carried by the execution results.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Provisioning step '{step}' failed: {message}")]
    Provisioning { step: String, message: String },

    #[error("Missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<String>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Skipped: {0}")]
    Skipped(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Endpoint {url} unreachable after {attempts} attempts")]
    Unreachable { url: String, attempts: usize },
}

impl Error {
    /// Build a provisioning error for the named step
    pub fn provisioning(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provisioning {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Build an assertion error
    pub fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion(message.into())
    }

    /// Whether this error marks a deliberately skipped case
    pub fn is_skip(&self) -> bool {
        matches!(self, Error::Skipped(_))
    }
}
