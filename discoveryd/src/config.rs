use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use discovery_client::DiscoveryConfig;
use shared::ServiceRecord;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub static_announce: Vec<StaticAnnounceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Create the discovery root before announcing
    #[serde(default = "default_build_root_path")]
    pub build_root_path: bool,
    /// Attempts for building the root path
    #[serde(default = "default_build_attempts")]
    pub build_attempts: u32,
    #[serde(default = "default_state_log_interval")]
    pub state_log_interval_secs: u64,
}

/// A service announced on behalf of something that cannot announce itself.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticAnnounceConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: Option<String>,
    pub scheme: String,
    pub address: String,
    pub port: u16,
}

fn default_build_root_path() -> bool {
    true
}

fn default_build_attempts() -> u32 {
    10
}

fn default_state_log_interval() -> u64 {
    60
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            build_root_path: default_build_root_path(),
            build_attempts: default_build_attempts(),
            state_log_interval_secs: default_state_log_interval(),
        }
    }
}

impl StaticAnnounceConfig {
    pub fn to_record(&self) -> Result<ServiceRecord> {
        ServiceRecord::static_announcement(
            Some(self.id),
            self.name.as_str(),
            self.service_type.as_deref(),
            &self.scheme,
            &self.address,
            self.port,
        )
        .with_context(|| format!("Invalid static announcement {}", self.id))
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
