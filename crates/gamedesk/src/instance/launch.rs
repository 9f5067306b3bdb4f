//! Projection of an instance onto the gaming container it runs in.

use serde::{Deserialize, Serialize};

use super::models::InstanceConfig;
use crate::allocator::{AllocationBundle, STREAMING_PORT_COUNT};
use crate::container::{ContainerConfig, ContainerError, ContainerResult, PortMapping};

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "josh5/steam-headless:latest";

/// Deployment-wide launch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    pub image: String,
    /// `TZ` inside the container.
    pub timezone: String,
    /// Login name of the streaming host.
    pub sunshine_user: String,
    pub shm_size: String,
    pub restart_policy: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            timezone: "UTC".to_string(),
            sunshine_user: "gamer".to_string(),
            shm_size: "2G".to_string(),
            restart_policy: "unless-stopped".to_string(),
        }
    }
}

/// Container name for an instance id.
pub fn container_name(instance_id: &str) -> String {
    format!("gaming_{}", instance_id)
}

/// Short hostname derived from the first eight characters of the id.
pub fn container_hostname(instance_id: &str) -> String {
    let short: String = instance_id.chars().take(8).collect();
    format!("gaming-{}", short)
}

fn flag(enabled: bool) -> &'static str {
    if enabled { "true" } else { "false" }
}

fn host_port(port: u32) -> ContainerResult<u16> {
    u16::try_from(port)
        .map_err(|_| ContainerError::InvalidInput(format!("port {} exceeds 65535", port)))
}

/// Build the container configuration for one instance.
///
/// Ports are published at the same number inside the container because the
/// services bind to the port they are told in the environment.
pub fn build_container_config(
    instance_id: &str,
    bundle: &AllocationBundle,
    config: &InstanceConfig,
    settings: &LaunchSettings,
) -> ContainerResult<ContainerConfig> {
    let name = container_name(instance_id);
    let hostname = container_hostname(instance_id);
    let novnc = host_port(bundle.novnc_port)?;
    let sunshine = host_port(bundle.sunshine_port)?;
    let sunshine_https = host_port(bundle.sunshine_port + 1)?;
    let sunshine_rtsp = host_port(bundle.sunshine_port + STREAMING_PORT_COUNT - 1)?;

    let mut container = ContainerConfig::new(settings.image.clone())
        .name(name.clone())
        .hostname(hostname.clone())
        .env("NAME", name)
        .env("TZ", settings.timezone.clone())
        .env("DISPLAY", format!(":{}", bundle.display))
        .env("USER_PASSWORD", config.user_password.clone())
        .env("MODE", "primary")
        .env("WEB_UI_MODE", "vnc")
        .env("ENABLE_VNC_AUDIO", flag(config.enable_audio))
        .env("PORT_NOVNC_WEB", bundle.novnc_port.to_string())
        .env("ENABLE_SUNSHINE", "true")
        .env("SUNSHINE_PORT", bundle.sunshine_port.to_string())
        .env("SUNSHINE_USER", settings.sunshine_user.clone())
        .env("SUNSHINE_PASS", config.user_password.clone())
        .env("ENABLE_STEAM", "true")
        .env("ENABLE_EVDEV_INPUTS", "true")
        .env("FORCE_X11_DUMMY_CONFIG", "true")
        .env("PUID", "1000")
        .env("PGID", "1000")
        .env("UMASK", "000")
        .env("SHM_SIZE", settings.shm_size.clone())
        .env(
            "NVIDIA_VISIBLE_DEVICES",
            if config.enable_gpu { "all" } else { "" },
        )
        .env("NVIDIA_DRIVER_CAPABILITIES", "all")
        .port(PortMapping::tcp(novnc, novnc))
        // Streaming: web UI (tcp+udp), HTTPS (tcp), RTSP (udp).
        .port(PortMapping::tcp(sunshine, sunshine))
        .port(PortMapping::udp(sunshine, sunshine))
        .port(PortMapping::tcp(sunshine_https, sunshine_https))
        .port(PortMapping::udp(sunshine_rtsp, sunshine_rtsp))
        .volume(format!("gaming_home_{}", instance_id), "/home/default")
        .volume(format!("gaming_games_{}", instance_id), "/mnt/games")
        .device("/dev/fuse")
        .device("/dev/uinput")
        .cap_add("NET_ADMIN")
        .cap_add("SYS_ADMIN")
        .cap_add("SYS_NICE")
        .security_opt("seccomp=unconfined")
        .security_opt("apparmor=unconfined")
        .shm_size(settings.shm_size.clone())
        .memory(config.memory_limit.clone())
        .cpus(config.cpu_limit.clone())
        .restart(settings.restart_policy.clone())
        .extra_host(hostname, "127.0.0.1")
        .label("gamedesk.instance", instance_id);

    if config.enable_gpu {
        container = container.device("/dev/dri");
    }

    Ok(container)
}
