//! Per-user gaming desktop provisioning.
//!
//! Each instance is a streaming-enabled gaming container with its own port
//! bundle and virtual display, tracked in a SQLite registry and served over
//! a small JSON API.

pub mod allocator;
pub mod api;
pub mod container;
pub mod db;
pub mod instance;
pub mod settings;
