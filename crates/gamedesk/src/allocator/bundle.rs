//! Per-instance resource bundles drawn from the port and display pools.

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::AllocationResult;
use super::pool::ResourcePool;

/// Ports consumed by each instance when sizing the port pool.
pub const PORTS_PER_INSTANCE: u32 = 5;

/// Width of the streaming port window (HTTP, HTTPS, RTSP).
pub const STREAMING_PORT_COUNT: u32 = 3;

/// Default first host port.
pub const DEFAULT_BASE_PORT: u32 = 12000;

/// Default instance capacity.
pub const DEFAULT_MAX_INSTANCES: u32 = 50;

/// Default first X display number.
pub const DEFAULT_DISPLAY_BASE: u32 = 55;

/// Resource range configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// First port of the port pool.
    pub base_port: u32,
    /// Number of instances the ranges are sized for.
    pub max_instances: u32,
    /// First display number of the display pool.
    pub display_base: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            max_instances: DEFAULT_MAX_INSTANCES,
            display_base: DEFAULT_DISPLAY_BASE,
        }
    }
}

impl AllocatorConfig {
    /// `[base_port, base_port + max_instances * 5)`.
    pub fn port_range(&self) -> Range<u32> {
        let end = self
            .base_port
            .saturating_add(self.max_instances.saturating_mul(PORTS_PER_INSTANCE));
        self.base_port..end
    }

    /// `[display_base, display_base + max_instances)`.
    pub fn display_range(&self) -> Range<u32> {
        self.display_base..self.display_base.saturating_add(self.max_instances)
    }

    /// Reject ranges that are empty, do not fit in the TCP port space, or
    /// overflow the display id space.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_instances == 0 {
            return Err("max_instances must be at least 1".to_string());
        }
        if self.base_port == 0 {
            return Err("base_port must be greater than 0".to_string());
        }
        let ports = u64::from(self.max_instances) * u64::from(PORTS_PER_INSTANCE);
        if u64::from(self.base_port) + ports > u64::from(u16::MAX) + 1 {
            return Err(format!(
                "port range {}..{} exceeds 65535",
                self.base_port,
                u64::from(self.base_port) + ports
            ));
        }
        if self.display_base.checked_add(self.max_instances).is_none() {
            return Err(format!(
                "display range starting at {} cannot hold {} displays",
                self.display_base, self.max_instances
            ));
        }
        Ok(())
    }
}

/// The three grants held by one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationBundle {
    /// Single port for the noVNC web client.
    pub novnc_port: u32,
    /// First of [`STREAMING_PORT_COUNT`] contiguous streaming ports.
    pub sunshine_port: u32,
    /// X display number.
    pub display: u32,
}

impl AllocationBundle {
    /// All streaming ports, in order.
    pub fn sunshine_ports(&self) -> Range<u32> {
        self.sunshine_port..self.sunshine_port + STREAMING_PORT_COUNT
    }
}

/// The port pool and the display pool.
///
/// The pools have independent locks; no method holds both at once.
#[derive(Debug)]
pub struct Allocators {
    ports: ResourcePool,
    displays: ResourcePool,
}

impl Allocators {
    /// Create empty pools sized from `config`.
    pub fn new(config: &AllocatorConfig) -> Self {
        Self {
            ports: ResourcePool::new("port", config.port_range()),
            displays: ResourcePool::new("display", config.display_range()),
        }
    }

    /// The shared port pool.
    pub fn ports(&self) -> &ResourcePool {
        &self.ports
    }

    /// The display pool.
    pub fn displays(&self) -> &ResourcePool {
        &self.displays
    }

    /// Allocate noVNC port, streaming window and display, in that order.
    ///
    /// On failure every grant already taken by this call is released in
    /// reverse order before the error is returned.
    pub fn allocate_bundle(&self) -> AllocationResult<AllocationBundle> {
        let novnc_port = self.ports.allocate_single()?;

        let sunshine_port = match self.ports.allocate_contiguous(STREAMING_PORT_COUNT) {
            Ok(port) => port,
            Err(e) => {
                self.ports.release(novnc_port);
                return Err(e);
            }
        };

        let display = match self.displays.allocate_single() {
            Ok(display) => display,
            Err(e) => {
                self.ports.release_range(sunshine_port, STREAMING_PORT_COUNT);
                self.ports.release(novnc_port);
                return Err(e);
            }
        };

        Ok(AllocationBundle {
            novnc_port,
            sunshine_port,
            display,
        })
    }

    /// Release every grant of `bundle`. Idempotent.
    pub fn release_bundle(&self, bundle: &AllocationBundle) {
        self.ports.release(bundle.novnc_port);
        self.ports
            .release_range(bundle.sunshine_port, STREAMING_PORT_COUNT);
        self.displays.release(bundle.display);
    }

    /// Mark a persisted bundle as held again.
    ///
    /// All or nothing: if any part is out of range or already held, nothing
    /// stays reserved and `false` is returned.
    pub fn reserve_bundle(&self, bundle: &AllocationBundle) -> bool {
        if !self.ports.reserve(bundle.novnc_port) {
            return false;
        }
        if !self
            .ports
            .reserve_range(bundle.sunshine_port, STREAMING_PORT_COUNT)
        {
            self.ports.release(bundle.novnc_port);
            return false;
        }
        if !self.displays.reserve(bundle.display) {
            self.ports
                .release_range(bundle.sunshine_port, STREAMING_PORT_COUNT);
            self.ports.release(bundle.novnc_port);
            return false;
        }
        true
    }
}

/// Holds a freshly allocated bundle and releases it on drop unless
/// [`commit`](BundleGuard::commit) is called.
#[derive(Debug)]
pub struct BundleGuard {
    allocators: Arc<Allocators>,
    bundle: AllocationBundle,
    armed: bool,
}

impl BundleGuard {
    /// Allocate a bundle from `allocators` and guard it.
    pub fn allocate(allocators: &Arc<Allocators>) -> AllocationResult<Self> {
        let bundle = allocators.allocate_bundle()?;
        Ok(Self::adopt(allocators, bundle))
    }

    /// Guard a bundle that is already held (e.g. one being torn down).
    pub fn adopt(allocators: &Arc<Allocators>, bundle: AllocationBundle) -> Self {
        Self {
            allocators: allocators.clone(),
            bundle,
            armed: true,
        }
    }

    /// The guarded bundle.
    pub fn bundle(&self) -> AllocationBundle {
        self.bundle
    }

    /// Keep the bundle allocated and hand it to the caller.
    pub fn commit(mut self) -> AllocationBundle {
        self.armed = false;
        self.bundle
    }

    /// Release the bundle now.
    pub fn release(mut self) {
        self.release_held();
    }

    fn release_held(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        log::debug!(
            "releasing allocation novnc={} sunshine={}..{} display={}",
            self.bundle.novnc_port,
            self.bundle.sunshine_port,
            self.bundle.sunshine_port + STREAMING_PORT_COUNT,
            self.bundle.display
        );
        self.allocators.release_bundle(&self.bundle);
    }
}

impl Drop for BundleGuard {
    fn drop(&mut self) {
        self.release_held();
    }
}
