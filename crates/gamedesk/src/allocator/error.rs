//! Allocation error types.

use thiserror::Error;

/// Result type for pool operations.
pub type AllocationResult<T> = Result<T, AllocationError>;

/// Errors returned by a [`ResourcePool`](super::ResourcePool).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    /// No free id (or no free window of the requested width) is left.
    #[error("{pool} pool exhausted: no {requested} free id(s) available")]
    Exhausted { pool: &'static str, requested: u32 },

    /// The request itself is malformed (e.g. a zero-width window).
    #[error("invalid {pool} pool request: {message}")]
    InvalidRequest { pool: &'static str, message: String },
}

impl AllocationError {
    /// Name of the pool that produced the error.
    pub fn pool(&self) -> &'static str {
        match self {
            Self::Exhausted { pool, .. } | Self::InvalidRequest { pool, .. } => pool,
        }
    }
}
