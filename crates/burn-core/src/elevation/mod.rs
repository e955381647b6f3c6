//! Elevated companion process.
//!
//! Work that needs administrative rights (per-machine packages, the
//! machine package cache, registration) runs in a second copy of the
//! engine started through a configured launcher. The two processes talk
//! over three authenticated pipes:
//!
//! - main: package execution, transactions, registration and approved exes
//! - cache: acquiring, verifying and removing cached payloads
//! - log: the companion's log lines, re-emitted by the engine
//!
//! [`proxy::ElevatedCompanion`] is the engine's handle and
//! [`companion::serve`] the companion's loop.

pub mod companion;
pub mod messages;
pub mod proxy;

use std::path::PathBuf;
use std::time::Duration;

use burn_config::EngineConfig;
use tracing::debug;

pub use companion::{CompanionArgs, CompanionExit, CompanionServices};
pub use messages::ElevationMessage;
pub use proxy::ElevatedCompanion;

use crate::hresult::HResult;
use crate::pipe::PipeError;

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("already elevated")]
    AlreadyElevated,
}

impl ElevationError {
    pub fn hresult(&self) -> HResult {
        match self {
            ElevationError::Pipe(e) => e.hresult(),
            ElevationError::Spawn { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => HResult::NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => HResult::E_ACCESSDENIED,
                _ => HResult::E_FAIL,
            },
            ElevationError::AlreadyElevated => HResult::ALREADY_INITIALIZED,
        }
    }
}

/// How to start and reach the companion.
#[derive(Debug, Clone)]
pub struct ElevationOptions {
    pub directory: PathBuf,
    pub connect_retries: u32,
    pub connect_wait: Duration,
    pub terminate_timeout: Duration,
    /// Program and arguments put in front of the companion command line.
    pub launcher: Vec<String>,
    /// `None` runs the current executable.
    pub companion_exe: Option<PathBuf>,
    /// Appended after the companion switches, e.g. the config file.
    pub extra_args: Vec<String>,
    /// Cache root the companion writes to.
    pub cache_root: PathBuf,
    /// Whether the companion's executor supports MSI transactions.
    pub transactions: bool,
}

impl ElevationOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            directory: config.pipe.endpoint_directory(),
            connect_retries: config.pipe.connect_retries,
            connect_wait: config.pipe.connect_wait(),
            terminate_timeout: config.pipe.terminate_timeout(),
            launcher: config.elevation.launcher.clone(),
            companion_exe: config.elevation.companion_exe.clone(),
            extra_args: Vec::new(),
            cache_root: config.cache.machine_root.clone(),
            transactions: false,
        }
    }

    fn companion_exe(&self) -> Result<PathBuf, ElevationError> {
        match &self.companion_exe {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(|source| ElevationError::Spawn {
                program: PathBuf::from("<current executable>"),
                source,
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(cache_root: PathBuf) -> Self {
        Self {
            directory: std::env::temp_dir(),
            connect_retries: 10,
            connect_wait: Duration::from_millis(50),
            terminate_timeout: Duration::from_secs(5),
            launcher: Vec::new(),
            companion_exe: None,
            extra_args: Vec::new(),
            cache_root,
            transactions: false,
        }
    }
}

/// Start the companion into `slot`.
///
/// Fails with [`ElevationError::AlreadyElevated`] when the slot is taken;
/// callers that only need the companion to exist treat that as success.
pub async fn elevate<'s>(
    slot: &'s mut Option<ElevatedCompanion>,
    options: &ElevationOptions,
) -> Result<&'s ElevatedCompanion, ElevationError> {
    if slot.is_some() {
        debug!("Companion already running");
        return Err(ElevationError::AlreadyElevated);
    }
    let companion = ElevatedCompanion::launch(options).await?;
    Ok(slot.insert(companion))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::channel::test_support::channel_pair;

    #[test]
    fn test_options_from_config() {
        let mut config = EngineConfig::default();
        config.elevation.launcher = vec!["pkexec".into()];
        let options = ElevationOptions::from_config(&config);
        assert_eq!(options.launcher, vec!["pkexec".to_string()]);
        assert_eq!(options.cache_root, config.cache.machine_root);
        assert_eq!(options.connect_retries, 1800);
        assert!(options.companion_exe().is_ok());
    }

    #[tokio::test]
    async fn test_second_elevation_is_rejected() {
        let (main, _m) = channel_pair();
        let (cache, _c) = channel_pair();
        let (log, _l) = channel_pair();
        let options = ElevationOptions::for_tests(std::env::temp_dir());
        let mut slot = Some(ElevatedCompanion::from_channels(main, cache, log, &options));
        let err = elevate(&mut slot, &options).await.unwrap_err();
        assert!(matches!(err, ElevationError::AlreadyElevated));
        assert_eq!(err.hresult(), HResult::ALREADY_INITIALIZED);
    }

    #[test]
    fn test_spawn_errors_map_to_hresults() {
        let err = ElevationError::Spawn {
            program: PathBuf::from("/missing"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.hresult(), HResult::NOT_FOUND);
    }
}
