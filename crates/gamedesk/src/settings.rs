//! Application configuration: defaults, TOML file, then `GAMEDESK__*`
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::allocator::AllocatorConfig;
use crate::container::{ContainerRuntime, RuntimeType};
use crate::instance::{DEFAULT_IMAGE, LaunchSettings};

pub const APP_NAME: &str = "gamedesk";

/// Database file name inside the data directory.
pub const DATABASE_FILE: &str = "instances.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub container: ContainerSettings,
    pub allocation: AllocatorConfig,
}

impl AppConfig {
    /// Load from `path` (missing file is fine) and the environment.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load) with an explicit environment map instead of
    /// the process environment.
    pub fn load_with_env(
        path: &Path,
        env_vars: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let defaults = AppConfig::default();
        let built = Config::builder()
            .set_default("logging.level", defaults.logging.level)?
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", i64::from(defaults.server.port))?
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(&env_prefix())
                    .separator("__")
                    .try_parsing(true)
                    .source(env_vars),
            )
            .build()
            .context("building configuration")?;

        let config: AppConfig = built
            .try_deserialize()
            .context("deserializing configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.allocation
            .validate()
            .map_err(|e| anyhow!("invalid allocation config: {}", e))?;
        crate::container::ContainerConfig::new(self.container.image.clone())
            .validate()
            .context("invalid container image")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when no verbosity flag is given.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: Option<String>,
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origins allowed to call the API from a browser.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 15000,
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// "docker" or "podman"; auto-detected if not set.
    pub runtime: Option<RuntimeType>,
    /// Custom path to the runtime binary.
    pub binary: Option<String>,
    pub image: String,
    /// Seconds `stop` waits before killing the container.
    pub stop_timeout_seconds: Option<u32>,
    pub timezone: String,
    pub sunshine_user: String,
    pub shm_size: String,
    pub restart_policy: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        let launch = LaunchSettings::default();
        Self {
            runtime: None,
            binary: None,
            image: DEFAULT_IMAGE.to_string(),
            stop_timeout_seconds: Some(10),
            timezone: launch.timezone,
            sunshine_user: launch.sunshine_user,
            shm_size: launch.shm_size,
            restart_policy: launch.restart_policy,
        }
    }
}

impl ContainerSettings {
    pub fn launch_settings(&self) -> LaunchSettings {
        LaunchSettings {
            image: self.image.clone(),
            timezone: self.timezone.clone(),
            sunshine_user: self.sunshine_user.clone(),
            shm_size: self.shm_size.clone(),
            restart_policy: self.restart_policy.clone(),
        }
    }

    /// Build the CLI runtime client these settings describe.
    pub fn runtime(&self) -> ContainerRuntime {
        match (self.runtime, &self.binary) {
            (Some(rt), Some(binary)) => ContainerRuntime::with_binary(rt, binary.clone()),
            (Some(rt), None) => ContainerRuntime::with_type(rt),
            (None, _) => ContainerRuntime::new(),
        }
    }
}

/// Write a commented default config file, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn xdg_dir(
    var: &str,
    platform: Option<PathBuf>,
    fallback: &[&str],
    what: &str,
) -> Result<PathBuf> {
    if let Some(dir) = env::var_os(var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }
    if let Some(dir) = platform {
        return Ok(dir.join(APP_NAME));
    }
    dirs::home_dir()
        .map(|home| fallback.iter().fold(home, |p, part| p.join(part)).join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine {} directory", what))
}

pub fn default_config_dir() -> Result<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", dirs::config_dir(), &[".config"], "configuration")
}

pub fn default_data_dir() -> Result<PathBuf> {
    xdg_dir("XDG_DATA_HOME", dirs::data_dir(), &[".local", "share"], "data")
}

pub fn default_state_dir() -> Result<PathBuf> {
    xdg_dir("XDG_STATE_HOME", dirs::state_dir(), &[".local", "state"], "state")
}

/// `GAMEDESK`: the app name upper-cased with non-alphanumerics as `_`.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
