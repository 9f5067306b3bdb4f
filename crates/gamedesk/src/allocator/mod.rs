//! Port and display allocation.
//!
//! Every instance holds one noVNC port, a contiguous window of streaming
//! ports and one X display number. Both kinds of ids come from bounded
//! in-memory pools owned by [`Allocators`].

mod bundle;
mod error;
mod pool;

pub use bundle::{
    AllocationBundle, AllocatorConfig, Allocators, BundleGuard, PORTS_PER_INSTANCE,
    STREAMING_PORT_COUNT,
};
pub use error::{AllocationError, AllocationResult};
pub use pool::ResourcePool;
