//! Starting and stopping an out-of-process bootstrapper application.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use burn_config::PipeConfig;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::api::EngineApi;
use super::client::BaLaunchArgs;
use super::events::{BaCommand, BaEvent, BootstrapperApplication};
use super::protocol::BOOTSTRAPPER_APPLICATION_API_VERSION;
use super::remote::RemoteBa;
use crate::hresult::HResult;
use crate::pipe::process::wait_for_exit;
use crate::pipe::{
    BA_CALLBACK_PIPE_SUFFIX, BA_ENGINE_PIPE_SUFFIX, ExitWait, PipeChannel, PipeError,
    PipeListener, serve_rpc, wait_for_client,
};
use crate::security::{generate_pipe_name, generate_secret};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Pipe(#[from] PipeError),

    #[error("failed to launch application {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("application refused to start")]
    Refused,

    #[error("no bootstrapper application configured")]
    NotConfigured,
}

impl HostError {
    pub fn hresult(&self) -> HResult {
        match self {
            HostError::Pipe(e) => e.hresult(),
            HostError::Launch { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                HResult::NOT_FOUND
            }
            HostError::Launch { .. } => HResult::E_FAIL,
            HostError::Refused => HResult::INSTALL_USEREXIT,
            HostError::NotConfigured => HResult::NOT_FOUND,
        }
    }
}

/// Pipe and process timing for hosting an application.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub directory: PathBuf,
    pub connect_retries: u32,
    pub connect_wait: Duration,
    pub exit_timeout: Duration,
}

impl HostOptions {
    pub fn from_config(pipe: &PipeConfig) -> Self {
        Self {
            directory: pipe.endpoint_directory(),
            connect_retries: pipe.connect_retries,
            connect_wait: pipe.connect_wait(),
            exit_timeout: pipe.terminate_timeout(),
        }
    }
}

/// How an application session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// `None` when killed, or still running at the timeout.
    pub exit_code: Option<i32>,
    /// The application asked to be started again.
    pub reload: bool,
    /// The application failed on its own; a fallback may take over.
    pub fallback: bool,
}

/// A running application and the tasks serving it.
#[derive(Debug)]
pub struct BaHost {
    path: PathBuf,
    ba: Arc<RemoteBa>,
    child: Child,
    server: JoinHandle<()>,
    exit_timeout: Duration,
}

async fn authenticate(
    listener: &mut PipeListener,
    child: &mut Child,
    options: &HostOptions,
    secret: &str,
) -> Result<PipeChannel, PipeError> {
    let stream = wait_for_client(
        listener,
        child,
        options.connect_retries,
        options.connect_wait,
    )
    .await?;
    PipeChannel::new(stream, listener.name())
        .verify_presented_secret(secret, std::process::id())
        .await
}

impl BaHost {
    /// Launch the application at `path`, wait for both of its pipes and
    /// send `Create`.
    pub async fn start(
        path: &Path,
        command: &BaCommand,
        api: EngineApi,
        options: &HostOptions,
    ) -> Result<Self, HostError> {
        let pipe = generate_pipe_name();
        let secret = generate_secret();
        let mut callbacks =
            PipeListener::bind(&options.directory, &format!("{pipe}{BA_CALLBACK_PIPE_SUFFIX}"))?;
        let mut requests =
            PipeListener::bind(&options.directory, &format!("{pipe}{BA_ENGINE_PIPE_SUFFIX}"))?;

        let launch = BaLaunchArgs {
            pipe,
            directory: options.directory.clone(),
            secret,
            api_version: BOOTSTRAPPER_APPLICATION_API_VERSION,
        };
        let mut child = Command::new(path)
            .args(launch.to_args())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Launch {
                path: path.to_path_buf(),
                source,
            })?;
        info!(
            path = %path.display(),
            pid = child.id().unwrap_or_default(),
            pipe = %launch.pipe,
            "Started bootstrapper application"
        );

        let callback_channel =
            authenticate(&mut callbacks, &mut child, options, &launch.secret).await?;
        let mut request_channel =
            authenticate(&mut requests, &mut child, options, &launch.secret).await?;

        let server = tokio::spawn(async move {
            let mut api = api;
            if let Err(e) = serve_rpc(&mut request_channel, &mut api).await {
                debug!(error = %e, "Application request pipe closed with an error");
            }
            api.peer_disconnected();
        });

        let ba = Arc::new(RemoteBa::new(callback_channel));
        let host = Self {
            path: path.to_path_buf(),
            ba,
            child,
            server,
            exit_timeout: options.exit_timeout,
        };
        let reply = host
            .ba
            .on_event(BaEvent::Create {
                command: command.clone(),
            })
            .await;
        if reply.wants_cancel() {
            warn!(path = %host.path.display(), "Application failed to create");
            host.stop(false).await?;
            return Err(HostError::Refused);
        }
        Ok(host)
    }

    /// The application, for the engine to send callbacks to.
    pub fn application(&self) -> Arc<RemoteBa> {
        Arc::clone(&self.ba)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send `Destroy`, disconnect and wait for the process to exit.
    ///
    /// An application that exits with a failure without having asked for a
    /// reload is reported as `fallback`.
    pub async fn stop(mut self, reload: bool) -> Result<StopOutcome, HostError> {
        self.ba.on_event(BaEvent::Destroy { reload }).await;
        if let Err(e) = self.ba.disconnect().await {
            debug!(error = %e, "Application callback pipe already closed");
        }

        let exit_code = match wait_for_exit(&mut self.child, self.exit_timeout).await? {
            ExitWait::Exited(code) => code,
            ExitWait::TimedOut => {
                warn!(
                    path = %self.path.display(),
                    timeout = ?self.exit_timeout,
                    "Application did not exit; killing it"
                );
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill application");
                }
                None
            }
        };
        if !self.server.is_finished() {
            self.server.abort();
        }
        let _ = self.server.await;

        let fallback = !reload && exit_code != Some(0);
        info!(
            path = %self.path.display(),
            ?exit_code,
            reload,
            fallback,
            "Bootstrapper application stopped"
        );
        Ok(StopOutcome {
            exit_code,
            reload,
            fallback,
        })
    }
}
