#![deny(unsafe_code)]

//! Configuration loading and validation for the Burn engine.
//!
//! Loads TOML configuration files and validates them. Provides the
//! [`EngineConfig`] type as the central configuration structure shared by
//! the engine, the elevated companion and the CLI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level engine configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Pipe transport timing and placement.
    #[serde(default)]
    pub pipe: PipeConfig,

    /// Package cache locations.
    #[serde(default)]
    pub cache: CacheConfig,

    /// How the privileged companion process is launched.
    #[serde(default)]
    pub elevation: ElevationConfig,

    /// Bootstrapper application (UI process) settings.
    #[serde(default)]
    pub ba: BaConfig,

    /// Roots under which elevated approved executables may live.
    #[serde(default)]
    pub trusted: TrustedConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Pipe transport configuration.
///
/// `connect_retries * connect_wait_ms` bounds how long a server waits for
/// its spawned client to connect before giving up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Number of connection polls while waiting for a client.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Milliseconds between connection polls.
    #[serde(default = "default_connect_wait_ms")]
    pub connect_wait_ms: u64,

    /// Seconds to wait for a terminated child process to exit.
    #[serde(default = "default_terminate_timeout_secs")]
    pub terminate_timeout_secs: u64,

    /// Directory holding pipe endpoints on platforms without a pipe namespace.
    /// Defaults to the system temp directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            connect_retries: default_connect_retries(),
            connect_wait_ms: default_connect_wait_ms(),
            terminate_timeout_secs: default_terminate_timeout_secs(),
            directory: None,
        }
    }
}

fn default_connect_retries() -> u32 {
    1800
}

fn default_connect_wait_ms() -> u64 {
    100
}

fn default_terminate_timeout_secs() -> u64 {
    60
}

impl PipeConfig {
    /// Resolve the directory pipe endpoints are created in.
    pub fn endpoint_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_secs(self.terminate_timeout_secs)
    }
}

/// Package cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Per-user package cache root.
    #[serde(default = "default_cache_root")]
    pub root: PathBuf,

    /// Per-machine package cache root. Only the elevated companion writes here,
    /// which is what makes it a trusted location for approved executables.
    #[serde(default = "default_machine_cache_root")]
    pub machine_root: PathBuf,

    /// Registration state file read by detect and written by registration.
    /// Defaults to `registration.toml` under `machine_root`.
    #[serde(default)]
    pub state: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            machine_root: default_machine_cache_root(),
            state: None,
        }
    }
}

impl CacheConfig {
    pub fn state_file(&self) -> PathBuf {
        self.state
            .clone()
            .unwrap_or_else(|| self.machine_root.join("registration.toml"))
    }
}

fn default_cache_root() -> PathBuf {
    std::env::temp_dir().join("burn").join("package-cache")
}

fn default_machine_cache_root() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\Package Cache")
    } else {
        PathBuf::from("/var/cache/burn/package-cache")
    }
}

/// Elevation configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ElevationConfig {
    /// Argument vector prefixed to the companion command line to obtain
    /// elevated rights (e.g. `["pkexec"]`). Empty runs the companion directly.
    #[serde(default)]
    pub launcher: Vec<String>,

    /// Companion executable. Defaults to the running executable.
    #[serde(default)]
    pub companion_exe: Option<PathBuf>,
}

/// Bootstrapper application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaConfig {
    /// Primary bootstrapper application executable.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Started once when the primary application fails without asking for a reload.
    #[serde(default)]
    pub prerequisite_path: Option<PathBuf>,

    /// Default milliseconds to wait for a launched approved exe to go idle.
    #[serde(default = "default_input_idle_ms")]
    pub approved_exe_input_idle_ms: u64,
}

impl Default for BaConfig {
    fn default() -> Self {
        Self {
            path: None,
            prerequisite_path: None,
            approved_exe_input_idle_ms: default_input_idle_ms(),
        }
    }
}

fn default_input_idle_ms() -> u64 {
    5000
}

/// Trusted location configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedConfig {
    /// Per-machine program roots (Program Files variants).
    #[serde(default = "default_program_files")]
    pub program_files: Vec<PathBuf>,
}

impl Default for TrustedConfig {
    fn default() -> Self {
        Self {
            program_files: default_program_files(),
        }
    }
}

fn default_program_files() -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![
            PathBuf::from(r"C:\Program Files"),
            PathBuf::from(r"C:\Program Files (x86)"),
        ]
    } else {
        vec![PathBuf::from("/opt"), PathBuf::from("/usr/local")]
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        debug!(path = %path.display(), "Loaded engine configuration");
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Directories an elevated approved executable may be launched from.
    pub fn trusted_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.trusted.program_files.clone();
        roots.push(self.cache.machine_root.clone());
        roots
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }
        if self.pipe.connect_retries == 0 {
            return Err(ConfigError::Validation(
                "pipe.connect_retries must be at least 1".to_string(),
            ));
        }
        if self.pipe.connect_wait_ms == 0 {
            return Err(ConfigError::Validation(
                "pipe.connect_wait_ms must be non-zero".to_string(),
            ));
        }
        if self.pipe.terminate_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "pipe.terminate_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.cache.root.as_os_str().is_empty() || self.cache.machine_root.as_os_str().is_empty()
        {
            return Err(ConfigError::Validation(
                "cache.root and cache.machine_root must not be empty".to_string(),
            ));
        }
        for (i, root) in self.trusted.program_files.iter().enumerate() {
            if !root.is_absolute() {
                return Err(ConfigError::Validation(format!(
                    "trusted.program_files[{i}] must be an absolute path, got {:?}",
                    root.display().to_string()
                )));
            }
        }
        if let Some(first) = self.elevation.launcher.first()
            && first.is_empty()
        {
            return Err(ConfigError::Validation(
                "elevation.launcher must not start with an empty program".to_string(),
            ));
        }
        Ok(())
    }
}
