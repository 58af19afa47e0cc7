//! Configuration management for the session-orchestration server.
//!
//! Loading, parsing, and validating configuration from a layered YAML file
//! plus environment variable overrides.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub cas: CasConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

/// Where the CAS blob store, the process registry database, and the
/// checkpoint timeline metadata live on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_cas_root")]
    pub cas_root: PathBuf,

    #[serde(default = "default_registry_db_path")]
    pub registry_db_path: PathBuf,

    #[serde(default = "default_timeline_dir")]
    pub timeline_dir: PathBuf,
}

fn default_cas_root() -> PathBuf {
    default_state_dir().join("cas")
}

fn default_registry_db_path() -> PathBuf {
    default_state_dir().join("registry.db")
}

fn default_timeline_dir() -> PathBuf {
    default_state_dir().join("timelines")
}

fn default_state_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "shannon", "shannon-core")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".shannon"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cas_root: default_cas_root(),
            registry_db_path: default_registry_db_path(),
            timeline_dir: default_timeline_dir(),
        }
    }
}

/// Caps on simultaneous in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
}

fn default_max_concurrent_sessions() -> usize {
    8
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_concurrent_sessions(),
        }
    }
}

/// Timeouts governing transport connects, outbound requests, and liveness
/// probing, all expressed in whole seconds in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_health_probe_interval_secs")]
    pub health_probe_interval_secs: u64,

    #[serde(default = "default_liveness_probe_interval_secs")]
    pub liveness_probe_interval_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_health_probe_interval_secs() -> u64 {
    30
}

fn default_liveness_probe_interval_secs() -> u64 {
    60
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            health_probe_interval_secs: default_health_probe_interval_secs(),
            liveness_probe_interval_secs: default_liveness_probe_interval_secs(),
        }
    }
}

impl TimeoutsConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn health_probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.health_probe_interval_secs)
    }

    pub fn liveness_probe_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.liveness_probe_interval_secs)
    }
}

/// Bounds on the stdout stream buffer shared by every session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_max_size")]
    pub max_size: usize,

    #[serde(default = "default_stream_max_line")]
    pub max_line_length: usize,
}

fn default_stream_max_size() -> usize {
    16 * 1024 * 1024
}

fn default_stream_max_line() -> usize {
    1024 * 1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_size: default_stream_max_size(),
            max_line_length: default_stream_max_line(),
        }
    }
}

/// Content-addressed store behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasConfig {
    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    #[serde(default = "default_true")]
    pub deduplication_enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            compression_enabled: default_true(),
            compression_level: default_compression_level(),
            deduplication_enabled: default_true(),
        }
    }
}

/// Where the MCP control plane looks for servers to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub discovery_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub discovery_config_path: Option<PathBuf>,

    #[serde(default = "default_binary_prefixes")]
    pub binary_prefixes: Vec<String>,
}

fn default_binary_prefixes() -> Vec<String> {
    vec!["mcp-".to_string()]
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            discovery_dirs: Vec::new(),
            discovery_config_path: None,
            binary_prefixes: default_binary_prefixes(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            timeouts: TimeoutsConfig::default(),
            stream: StreamConfig::default(),
            cas: CasConfig::default(),
            mcp: McpConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults (with a
    /// warning) if the file does not exist, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_vars();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(CoreError::Io)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    fn apply_env_vars(&mut self) {
        if let Ok(v) = std::env::var("SHANNON_CAS_ROOT") {
            self.storage.cas_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHANNON_REGISTRY_DB_PATH") {
            self.storage.registry_db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHANNON_TIMELINE_DIR") {
            self.storage.timeline_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SHANNON_MAX_CONCURRENT_SESSIONS") {
            if let Ok(n) = v.parse() {
                self.concurrency.max_concurrent_sessions = n;
            }
        }
        if let Ok(v) = std::env::var("SHANNON_REQUEST_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.timeouts.request_timeout_secs = n;
            }
        }
    }

    /// Range-check every numeric field; called once after load.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency.max_concurrent_sessions == 0 {
            return Err(
                CoreError::Configuration("concurrency.max_concurrent_sessions must be greater than 0".to_string())
                    .into(),
            );
        }

        if self.timeouts.connect_timeout_secs == 0 {
            return Err(CoreError::Configuration(
                "timeouts.connect_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.timeouts.request_timeout_secs == 0 {
            return Err(CoreError::Configuration(
                "timeouts.request_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        if self.stream.max_size == 0 {
            return Err(CoreError::Configuration("stream.max_size must be greater than 0".to_string()).into());
        }

        if self.stream.max_line_length == 0 || self.stream.max_line_length > self.stream.max_size {
            return Err(CoreError::Configuration(
                "stream.max_line_length must be greater than 0 and no larger than stream.max_size".to_string(),
            )
            .into());
        }

        if !(0..=22).contains(&self.cas.compression_level) {
            return Err(
                CoreError::Configuration("cas.compression_level must be between 0 and 22".to_string()).into(),
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    #[test]
    fn defaults_validate_cleanly() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let mut config = Config::default();
        config.concurrency.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stream_max_line_larger_than_max_size_fails_validation() {
        let mut config = Config::default();
        config.stream.max_size = 100;
        config.stream.max_line_length = 200;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let path = std::path::Path::new("/nonexistent/shannon-config.yaml");
        let config = Config::load(path).expect("load should fall back to defaults");
        assert_eq!(
            config.concurrency.max_concurrent_sessions,
            default_max_concurrent_sessions()
        );
    }

    #[test]
    fn from_file_round_trips_yaml() {
        let dir = temp_dir();
        let path = dir.path().join("config.yaml");
        let yaml = "concurrency:\n  max_concurrent_sessions: 4\n";
        std::fs::write(&path, yaml).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.concurrency.max_concurrent_sessions, 4);
    }
}
