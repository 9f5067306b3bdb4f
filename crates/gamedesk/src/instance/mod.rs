//! Gaming instance management.
//!
//! Handles the lifecycle of gaming desktops: resource allocation, container
//! launch, persistence and teardown.

mod error;
mod launch;
mod models;
mod repository;
mod service;

pub use error::{InstanceError, InstanceResult};
pub use launch::{DEFAULT_IMAGE, LaunchSettings, build_container_config, container_name};
pub use models::{
    CreateInstanceRequest, DeleteReport, Instance, InstanceConfig, InstanceConfigOverrides,
    InstanceStatus, RestoreReport,
};
pub use repository::InstanceRepository;
pub use service::{InstanceService, InstanceServiceConfig};
