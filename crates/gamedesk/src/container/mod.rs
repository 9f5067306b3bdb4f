//! Container runtime adapter.
//!
//! Drives the Docker or Podman CLI asynchronously. The runtime is
//! auto-detected or configured explicitly. Callers depend on the
//! [`ContainerRuntimeApi`] trait so tests can substitute a fake.

mod config;
mod error;

pub use config::{ContainerConfig, PortMapping, Protocol, validate_byte_size};
pub use error::{ContainerError, ContainerResult};

use config::{validate_container_name, validate_image_name};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether bind mounts need the `:Z` SELinux label.
    pub fn needs_selinux_labels(&self) -> bool {
        matches!(self, RuntimeType::Podman)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "podman" => Ok(RuntimeType::Podman),
            other => Err(format!("unknown container runtime: {}", other)),
        }
    }
}

/// Launch and teardown operations the instance lifecycle depends on.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create and start a container, returning its id.
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Stop a container. `ContainerNotFound` if it does not exist.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()>;

    /// Remove a container. `ContainerNotFound` if it does not exist.
    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()>;
}

/// Docker/Podman CLI client.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.create_container(config).await
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> ContainerResult<()> {
        self.stop_container(container_id, timeout_seconds).await
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        self.remove_container(container_id, force).await
    }
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Detect an installed runtime, preferring Docker.
    ///
    /// Falls back to Docker when neither binary is found; commands then fail
    /// with [`ContainerError::NoRuntimeAvailable`].
    pub fn new() -> Self {
        let runtime_type = [RuntimeType::Docker, RuntimeType::Podman]
            .into_iter()
            .find(|rt| Self::is_binary_available(rt.default_binary()))
            .unwrap_or_default();
        Self::with_type(runtime_type)
    }

    /// Use the default binary of `runtime_type`.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Use a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the binary with `args` and collect its output.
    async fn exec(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ContainerError::NoRuntimeAvailable
                } else {
                    ContainerError::CommandFailed {
                        command: command.to_string(),
                        message: e.to_string(),
                    }
                }
            })
    }

    /// Check the runtime responds and return its version report.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let args = ["version", "--format", "json"].map(String::from);
        let output = self.exec("version", &args).await?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "version".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Whether `image` is present locally.
    pub async fn image_exists(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;

        let args = ["image".to_string(), "inspect".to_string(), image.to_string()];
        let output = self.exec("image inspect", &args).await?;
        Ok(output.status.success())
    }

    /// Create and start a container from a validated config.
    pub async fn create_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let output = self
            .exec("run", &config.run_args(self.runtime_type))
            .await?;

        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Stop a running container.
    pub async fn stop_container(
        &self,
        container_id: &str,
        timeout: Option<u32>,
    ) -> ContainerResult<()> {
        validate_container_name(container_id)?;

        let mut args = vec!["stop".to_string()];
        if let Some(t) = timeout {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("stop", &args).await?;
        check_status("stop", container_id, &output)
    }

    /// Remove a container.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(container_id)?;

        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        let output = self.exec("rm", &args).await?;
        check_status("rm", container_id, &output)
    }
}

/// Map a failed teardown command to an error, recognising "already gone".
fn check_status(command: &str, container_id: &str, output: &Output) -> ContainerResult<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_not_found_message(&stderr) {
        return Err(ContainerError::ContainerNotFound(container_id.to_string()));
    }

    Err(ContainerError::CommandFailed {
        command: command.to_string(),
        message: stderr.trim().to_string(),
    })
}

/// Docker says "No such container", Podman "no container with name or ID".
fn is_not_found_message(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container") || lower.contains("no container with name or id")
}
