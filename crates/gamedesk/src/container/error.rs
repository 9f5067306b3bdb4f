//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime command ran and failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The container does not exist (already removed or never created).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Neither docker nor podman could be executed.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// A configuration value was rejected before reaching the runtime.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ContainerError {
    /// Whether this error means the container is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }
}
