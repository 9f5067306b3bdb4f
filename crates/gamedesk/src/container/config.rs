//! Container launch configuration and input validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use super::RuntimeType;
use super::error::{ContainerError, ContainerResult};

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortMapping {
    /// TCP mapping.
    pub fn tcp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// UDP mapping.
    pub fn udp(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Udp,
        }
    }

    /// `-p` argument, e.g. `12001:12001/udp`.
    pub fn to_arg(&self) -> String {
        format!(
            "{}:{}/{}",
            self.host_port, self.container_port, self.protocol
        )
    }
}

/// Configuration for creating a new container.
///
/// Built with the chained setters and checked with [`validate`] before any
/// runtime command is issued.
///
/// [`validate`]: ContainerConfig::validate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub hostname: Option<String>,
    /// OCI image reference.
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Volume mounts as (source, target). A source without a leading `/` is a
    /// named volume.
    pub volumes: Vec<(String, String)>,
    /// Host device paths passed through unchanged.
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    /// Size of `/dev/shm`, e.g. `2g`.
    pub shm_size: Option<String>,
    /// Memory limit, e.g. `4g`.
    pub memory: Option<String>,
    /// CPU limit, e.g. `2` or `1.5`.
    pub cpus: Option<String>,
    /// Restart policy, e.g. `unless-stopped`.
    pub restart: Option<String>,
    /// Extra `/etc/hosts` entries as (hostname, ip).
    pub extra_hosts: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set an environment variable, replacing any earlier value.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn volume(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.volumes.push((source.into(), target.into()));
        self
    }

    pub fn device(mut self, path: impl Into<String>) -> Self {
        self.devices.push(path.into());
        self
    }

    pub fn cap_add(mut self, capability: impl Into<String>) -> Self {
        self.cap_add.push(capability.into());
        self
    }

    pub fn security_opt(mut self, opt: impl Into<String>) -> Self {
        self.security_opt.push(opt.into());
        self
    }

    pub fn shm_size(mut self, size: impl Into<String>) -> Self {
        self.shm_size = Some(size.into());
        self
    }

    pub fn memory(mut self, limit: impl Into<String>) -> Self {
        self.memory = Some(limit.into());
        self
    }

    pub fn cpus(mut self, limit: impl Into<String>) -> Self {
        self.cpus = Some(limit.into());
        self
    }

    pub fn restart(mut self, policy: impl Into<String>) -> Self {
        self.restart = Some(policy.into());
        self
    }

    pub fn extra_host(mut self, host: impl Into<String>, ip: impl Into<String>) -> Self {
        self.extra_hosts.push((host.into(), ip.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validate all container configuration fields.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }
        if let Some(ref hostname) = self.hostname {
            validate_hostname(hostname)?;
        }

        for (key, value) in &self.env {
            validate_env_var_key(key)?;
            if value.contains('\0') {
                return Err(ContainerError::InvalidInput(format!(
                    "environment variable '{}' contains a null byte",
                    key
                )));
            }
        }

        for (source, target) in &self.volumes {
            validate_volume_source(source)?;
            validate_container_path(target)?;
        }

        for device in &self.devices {
            validate_device_path(device)?;
        }

        for cap in &self.cap_add {
            validate_capability(cap)?;
        }

        for opt in &self.security_opt {
            validate_security_opt(opt)?;
        }

        if let Some(ref size) = self.shm_size {
            validate_byte_size(size, "shm size")?;
        }
        if let Some(ref memory) = self.memory {
            validate_byte_size(memory, "memory limit")?;
        }
        if let Some(ref cpus) = self.cpus {
            validate_cpus(cpus)?;
        }
        if let Some(ref restart) = self.restart {
            validate_restart_policy(restart)?;
        }

        for (host, ip) in &self.extra_hosts {
            validate_hostname(host)?;
            ip.parse::<IpAddr>().map_err(|_| {
                ContainerError::InvalidInput(format!("extra host '{}' has invalid ip '{}'", host, ip))
            })?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        Ok(())
    }

    /// Arguments for `<runtime> run`, excluding the binary itself.
    ///
    /// Does not validate; call [`validate`](Self::validate) first.
    pub fn run_args(&self, runtime_type: RuntimeType) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = self.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }
        if let Some(ref hostname) = self.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }

        for port in &self.ports {
            args.push("-p".to_string());
            args.push(port.to_arg());
        }

        for (source, target) in &self.volumes {
            args.push("-v".to_string());
            // Only bind mounts need an SELinux relabel.
            if source.starts_with('/') && runtime_type.needs_selinux_labels() {
                args.push(format!("{}:{}:Z", source, target));
            } else {
                args.push(format!("{}:{}", source, target));
            }
        }

        for device in &self.devices {
            args.push("--device".to_string());
            args.push(device.clone());
        }
        for cap in &self.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }
        for opt in &self.security_opt {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }

        if let Some(ref size) = self.shm_size {
            args.push("--shm-size".to_string());
            args.push(size.clone());
        }
        if let Some(ref memory) = self.memory {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(ref cpus) = self.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.clone());
        }
        if let Some(ref restart) = self.restart {
            args.push("--restart".to_string());
            args.push(restart.clone());
        }

        for (host, ip) in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(format!("{}:{}", host, ip));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

const DANGEROUS_CHARS: [char; 21] = [
    '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\', '"',
    '\'', '\n', '\r',
];

fn reject_dangerous(value: &str, what: &str) -> ContainerResult<()> {
    if value.contains('\0') {
        return Err(ContainerError::InvalidInput(format!(
            "{} cannot contain null bytes",
            what
        )));
    }
    if let Some(c) = value.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} contains dangerous character '{}'",
            what, c
        )));
    }
    Ok(())
}

/// Validate an OCI image reference: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }
    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }
    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }
    Ok(())
}

/// Validate a container name or id: alphanumeric plus `-` and `_`, starting
/// with an alphanumeric character or underscore.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };
    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }
    if !first.is_ascii_alphanumeric() && first != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// RFC 1123 hostname.
fn validate_hostname(hostname: &str) -> ContainerResult<()> {
    if hostname.is_empty() {
        return Err(ContainerError::InvalidInput(
            "hostname cannot be empty".to_string(),
        ));
    }
    if hostname.len() > 253 {
        return Err(ContainerError::InvalidInput(
            "hostname exceeds maximum length of 253 characters".to_string(),
        ));
    }

    for label in hostname.split('.') {
        let (Some(first), Some(last)) = (label.chars().next(), label.chars().last()) else {
            return Err(ContainerError::InvalidInput(
                "hostname cannot have empty labels".to_string(),
            ));
        };
        if label.len() > 63 {
            return Err(ContainerError::InvalidInput(
                "hostname label exceeds maximum length of 63 characters".to_string(),
            ));
        }
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(ContainerError::InvalidInput(
                "hostname labels must start and end with alphanumeric characters".to_string(),
            ));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ContainerError::InvalidInput(format!(
                "hostname '{}' contains invalid characters",
                hostname
            )));
        }
    }
    Ok(())
}

/// POSIX environment variable name.
fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };
    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }
    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }
    Ok(())
}

/// Host path or named volume.
fn validate_volume_source(source: &str) -> ContainerResult<()> {
    if source.is_empty() {
        return Err(ContainerError::InvalidInput(
            "volume source cannot be empty".to_string(),
        ));
    }
    if source.len() > 4096 {
        return Err(ContainerError::InvalidInput(
            "volume source exceeds maximum length of 4096 characters".to_string(),
        ));
    }
    if source.starts_with('/') || source.starts_with('.') {
        return reject_dangerous(source, "volume source");
    }
    // Named volume.
    validate_container_name(source)
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }
    reject_dangerous(path, "container path")
}

fn validate_device_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with("/dev/") {
        return Err(ContainerError::InvalidInput(format!(
            "device '{}' must be under /dev",
            path
        )));
    }
    if path.contains("..") {
        return Err(ContainerError::InvalidInput(
            "device path cannot contain '..'".to_string(),
        ));
    }
    reject_dangerous(path, "device path")
}

/// Linux capability name, e.g. `SYS_ADMIN`.
fn validate_capability(cap: &str) -> ContainerResult<()> {
    if cap.is_empty()
        || !cap
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ContainerError::InvalidInput(format!(
            "invalid capability '{}'",
            cap
        )));
    }
    Ok(())
}

/// `key:value` or `key=value` security option.
fn validate_security_opt(opt: &str) -> ContainerResult<()> {
    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, ':' | '=' | '-' | '_' | '.' | '/');
    if opt.is_empty() || !opt.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid security option '{}'",
            opt
        )));
    }
    Ok(())
}

/// Byte size such as `512m`, `4G` or `1073741824`.
pub fn validate_byte_size(value: &str, what: &str) -> ContainerResult<()> {
    let digits = value
        .strip_suffix(|c: char| matches!(c.to_ascii_lowercase(), 'b' | 'k' | 'm' | 'g'))
        .unwrap_or(value);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid {} '{}'",
            what, value
        )));
    }
    Ok(())
}

fn validate_cpus(value: &str) -> ContainerResult<()> {
    match value.parse::<f64>() {
        Ok(cpus) if cpus.is_finite() && cpus > 0.0 => Ok(()),
        _ => Err(ContainerError::InvalidInput(format!(
            "invalid cpu limit '{}'",
            value
        ))),
    }
}

fn validate_restart_policy(policy: &str) -> ContainerResult<()> {
    let valid = match policy.split_once(':') {
        Some(("on-failure", retries)) => retries.parse::<u32>().is_ok(),
        Some(_) => false,
        None => matches!(policy, "no" | "always" | "unless-stopped" | "on-failure"),
    };
    if !valid {
        return Err(ContainerError::InvalidInput(format!(
            "invalid restart policy '{}'",
            policy
        )));
    }
    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_');
    if key.is_empty() || !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "invalid label key '{}'",
            key
        )));
    }
    Ok(())
}
