//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create [`EngineConfig`] values whose pipes,
//! caches and registration state all live under one temporary directory.

use std::path::{Path, PathBuf};

use burn_config::EngineConfig;

/// Fluent builder for [`EngineConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let dir = tempfile::tempdir().unwrap();
/// let config = TestConfigBuilder::new(dir.path())
///     .ba_path("/opt/setup/ui")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: EngineConfig,
}

impl TestConfigBuilder {
    /// Pipes in `root`, caches and state below it, and short pipe timeouts.
    pub fn new(root: &Path) -> Self {
        let mut config = EngineConfig::default();
        config.pipe.directory = Some(root.to_path_buf());
        config.pipe.connect_retries = 500;
        config.pipe.connect_wait_ms = 10;
        config.pipe.terminate_timeout_secs = 5;
        config.cache.root = root.join("user-cache");
        config.cache.machine_root = root.join("machine-cache");
        config.cache.state = Some(root.join("registration.toml"));
        config.trusted.program_files = vec![root.join("programs")];
        Self { config }
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn ba_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ba.path = Some(path.into());
        self
    }

    pub fn prerequisite_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ba.prerequisite_path = Some(path.into());
        self
    }

    pub fn launcher(mut self, argv: &[&str]) -> Self {
        self.config.elevation.launcher = argv.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn companion_exe(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.elevation.companion_exe = Some(path.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
