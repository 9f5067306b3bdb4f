//! Instance lifecycle errors.

use thiserror::Error;

use super::models::InstanceStatus;
use crate::allocator::AllocationError;

/// Errors returned by [`InstanceService`](super::InstanceService).
#[derive(Debug, Error)]
pub enum InstanceError {
    /// A port or display pool had no room. Nothing stays allocated.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(#[from] AllocationError),

    /// The runtime refused to start the container. Nothing stays allocated.
    #[error("failed to launch container: {0}")]
    LaunchFailed(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("cannot move instance from {from} to {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// The instance registry failed.
    #[error("instance store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

pub type InstanceResult<T> = Result<T, InstanceError>;
