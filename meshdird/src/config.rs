use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DIRECTORY_SERVICE_TYPE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dump: DumpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Host name to announce under; the system hostname when unset
    #[serde(default)]
    pub host_name: Option<String>,
    /// Restrict mDNS to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_ttl")]
    pub default_ttl: u8,
    #[serde(default = "default_lifetime")]
    pub default_lifetime: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    #[serde(default = "default_dump_path")]
    pub path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/meshdird.sock")
}

fn default_service_type() -> String {
    DIRECTORY_SERVICE_TYPE.to_string()
}

fn default_ttl() -> u8 {
    5
}

fn default_lifetime() -> u32 {
    0
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_dump_path() -> PathBuf {
    PathBuf::from("/var/lib/meshdird/services.json")
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            host_name: None,
            interface: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            default_lifetime: default_lifetime(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            path: default_dump_path(),
        }
    }
}

impl RegistryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl DiscoveryConfig {
    /// Configured host name, falling back to the system hostname.
    pub fn resolve_host_name(&self) -> Result<String> {
        match &self.host_name {
            Some(name) => Ok(name.clone()),
            None => Ok(hostname::get()
                .context("Failed to get system hostname")?
                .to_string_lossy()
                .to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }
}
