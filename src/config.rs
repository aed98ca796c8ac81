//! Session and relay configuration
//!
//! `SessionConfig` describes which project to run and where its debugger
//! listens. `RelayConfig` holds timing knobs, read from
//! `<config dir>/nvlist-debug-relay/relay.toml` when present.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::validate_and_canonicalize_path;
use crate::{Error, Result};

/// Port the runtime's debug server listens on unless told otherwise
pub const DEFAULT_DEBUG_PORT: u16 = 12345;

/// Host the runtime's debug server listens on
pub const DEFAULT_DEBUG_HOST: &str = "127.0.0.1";

/// Where to find and how to start the debuggee. Fixed once initialize starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Project root, passed to the build as `-PvnRoot`
    pub project_folder: PathBuf,

    /// Folder holding the build-tool wrapper; used as working directory
    pub build_tools_folder: PathBuf,

    /// Alternate Java home for the build tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_home: Option<PathBuf>,

    /// Debug server port (defaults to [`DEFAULT_DEBUG_PORT`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Script the user asked to debug
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    DEFAULT_DEBUG_HOST.to_string()
}

impl SessionConfig {
    /// Configuration for a project laid out the standard way, with the build
    /// tools in `<project>/build-tools`
    pub fn for_project(project_folder: impl Into<PathBuf>) -> Self {
        let project_folder = project_folder.into();
        let build_tools_folder = project_folder.join("build-tools");
        Self {
            project_folder,
            build_tools_folder,
            runtime_home: None,
            port: None,
            program: None,
            host: default_host(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_DEBUG_PORT)
    }

    /// Canonicalize the folders, failing if either is missing
    pub fn validate(&self) -> Result<Self> {
        let project_folder = validate_and_canonicalize_path(&self.project_folder)?;
        let build_tools_folder = validate_and_canonicalize_path(&self.build_tools_folder)?;
        if !build_tools_folder.is_dir() {
            return Err(Error::Config(format!(
                "Build tools folder is not a directory: {:?}",
                build_tools_folder
            )));
        }

        Ok(Self {
            project_folder,
            build_tools_folder,
            ..self.clone()
        })
    }
}

/// Relay timing and launch knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a forwarded request waits for the remote's answer
    pub request_timeout_ms: u64,

    /// Bound on a single connection attempt
    pub connect_timeout_ms: u64,

    /// Fixed delay between connection attempts
    pub retry_interval_ms: u64,

    /// Stop retrying after this many attempts (unbounded if unset)
    pub max_connect_attempts: Option<u32>,

    /// Budget for writing the best-effort disconnect to the remote
    pub disconnect_timeout_ms: u64,

    /// Build task that starts the runtime with its debug server
    pub gradle_task: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 30_000,
            retry_interval_ms: 1_000,
            max_connect_attempts: None,
            disconnect_timeout_ms: 2_000,
            gradle_task: "runDesktop".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Directory holding `relay.toml`
pub fn get_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("nvlist-debug-relay"))
        .unwrap_or_else(|| PathBuf::from(".nvlist-debug-relay"))
}

/// Read the relay configuration from the default location
pub fn read_relay_config() -> Result<RelayConfig> {
    let config_path = get_config_dir().join("relay.toml");

    if !config_path.exists() {
        tracing::debug!("No relay config at {:?}, using defaults", config_path);
        return Ok(RelayConfig::default());
    }

    read_relay_config_from_path(&config_path)
}

/// Read the relay configuration from a specific path
pub fn read_relay_config_from_path(path: &Path) -> Result<RelayConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read relay config: {}", e)))?;

    let config: RelayConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse relay config: {}", e)))?;

    tracing::debug!("Loaded relay config from {:?}: {:?}", path, config);

    Ok(config)
}
