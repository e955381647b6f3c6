//! Application side of the engine connection.
//!
//! A Rust application (or a test) parses the switches it was launched with,
//! connects both pipes, serves callbacks on one and calls engine functions
//! on the other.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::events::BootstrapperApplication;
use super::protocol::{
    BOOTSTRAPPER_APPLICATION_API_VERSION, EngineRequest, EngineResponse, LogLevel,
    MESSAGE_TYPE_BA_EVENT, MESSAGE_TYPE_ENGINE_REQUEST, switches,
};
use crate::BoxFuture;
use crate::hresult::HResult;
use crate::model::{BundleAction, DownloadSource};
use crate::pipe::{
    BA_CALLBACK_PIPE_SUFFIX, BA_ENGINE_PIPE_SUFFIX, PipeChannel, PipeError, PipeMessage,
    RpcHandle, RpcService, connect, serve_rpc,
};

/// Connection details passed on the application's command line.
#[derive(Clone, PartialEq, Eq)]
pub struct BaLaunchArgs {
    pub pipe: String,
    pub directory: PathBuf,
    pub secret: Zeroizing<String>,
    pub api_version: u32,
}

impl std::fmt::Debug for BaLaunchArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaLaunchArgs")
            .field("pipe", &self.pipe)
            .field("directory", &self.directory)
            .field("secret", &"[REDACTED]")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl BaLaunchArgs {
    /// Switches for the application's command line.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            switches::PIPE.to_string(),
            self.pipe.clone(),
            switches::PIPE_DIRECTORY.to_string(),
            self.directory.display().to_string(),
            switches::SECRET.to_string(),
            self.secret.as_str().to_string(),
            switches::API_VERSION.to_string(),
            self.api_version.to_string(),
        ]
    }

    /// Pick the engine switches out of a command line, ignoring anything
    /// else. `None` when the pipe or secret is missing.
    pub fn from_args<I, S>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut pipe = None;
        let mut directory = None;
        let mut secret = None;
        let mut api_version = BOOTSTRAPPER_APPLICATION_API_VERSION;
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            let name = arg.as_ref();
            if ![
                switches::PIPE,
                switches::PIPE_DIRECTORY,
                switches::SECRET,
                switches::API_VERSION,
            ]
            .contains(&name)
            {
                continue;
            }
            let value = args.next()?;
            let value = value.as_ref();
            match name {
                switches::PIPE => pipe = Some(value.to_string()),
                switches::PIPE_DIRECTORY => directory = Some(PathBuf::from(value)),
                switches::SECRET => secret = Some(Zeroizing::new(value.to_string())),
                _ => api_version = value.parse().ok()?,
            }
        }
        Some(Self {
            pipe: pipe?,
            directory: directory.unwrap_or_else(std::env::temp_dir),
            secret: secret?,
            api_version,
        })
    }
}

/// Connect both pipes. Returns the engine connection and the callback
/// channel, which the caller serves with [`serve_callbacks`].
pub async fn connect_to_engine(
    args: &BaLaunchArgs,
) -> Result<(BaConnection, PipeChannel), PipeError> {
    if args.api_version != BOOTSTRAPPER_APPLICATION_API_VERSION {
        warn!(
            engine = args.api_version,
            ours = BOOTSTRAPPER_APPLICATION_API_VERSION,
            "Engine speaks a different application API version"
        );
    }
    let callbacks = open(&args.directory, &args.pipe, BA_CALLBACK_PIPE_SUFFIX, &args.secret).await?;
    let engine = open(&args.directory, &args.pipe, BA_ENGINE_PIPE_SUFFIX, &args.secret).await?;
    debug!(pipe = %args.pipe, engine_pid = engine.peer_pid(), "Connected to engine");
    Ok((BaConnection::new(engine), callbacks))
}

async fn open(
    directory: &Path,
    base: &str,
    suffix: &str,
    secret: &str,
) -> Result<PipeChannel, PipeError> {
    let name = format!("{base}{suffix}");
    let stream = connect(directory, &name).await?;
    PipeChannel::new(stream, name)
        .present_secret(secret, std::process::id())
        .await
}

/// Calls engine functions.
#[derive(Debug)]
pub struct BaConnection {
    rpc: RpcHandle,
}

fn unexpected() -> PipeError {
    PipeError::Malformed("unexpected engine response")
}

impl BaConnection {
    pub fn new(channel: PipeChannel) -> Self {
        Self {
            rpc: RpcHandle::new(channel),
        }
    }

    /// Send one request. A failure code from the engine is `Remote`.
    pub async fn request(&self, request: &EngineRequest) -> Result<EngineResponse, PipeError> {
        let payload = serde_json::to_vec(request)?;
        let data = self
            .rpc
            .call_checked(MESSAGE_TYPE_ENGINE_REQUEST, &payload)
            .await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn done(&self, request: EngineRequest) -> Result<(), PipeError> {
        match self.request(&request).await? {
            EngineResponse::Done => Ok(()),
            _ => Err(unexpected()),
        }
    }

    async fn string(&self, request: EngineRequest) -> Result<Zeroizing<String>, PipeError> {
        match self.request(&request).await? {
            EngineResponse::String { value } => Ok(Zeroizing::new(value)),
            _ => Err(unexpected()),
        }
    }

    pub async fn detect(&self) -> Result<(), PipeError> {
        self.done(EngineRequest::Detect).await
    }

    pub async fn plan(&self, action: BundleAction) -> Result<(), PipeError> {
        self.done(EngineRequest::Plan { action }).await
    }

    pub async fn elevate(&self) -> Result<(), PipeError> {
        self.done(EngineRequest::Elevate).await
    }

    pub async fn apply(&self) -> Result<(), PipeError> {
        self.done(EngineRequest::Apply).await
    }

    pub async fn quit(&self, exit_code: u32) -> Result<(), PipeError> {
        self.done(EngineRequest::Quit { exit_code }).await
    }

    pub async fn launch_approved_exe(
        &self,
        id: &str,
        arguments: Option<&str>,
        wait: Option<Duration>,
    ) -> Result<(), PipeError> {
        self.done(EngineRequest::LaunchApprovedExe {
            id: id.to_string(),
            arguments: arguments.map(str::to_string),
            wait_ms: wait.map(|w| u64::try_from(w.as_millis()).unwrap_or(u64::MAX)),
        })
        .await
    }

    pub async fn get_variable_numeric(&self, name: &str) -> Result<i64, PipeError> {
        match self
            .request(&EngineRequest::GetVariableNumeric {
                name: name.to_string(),
            })
            .await?
        {
            EngineResponse::Numeric { value } => Ok(value),
            _ => Err(unexpected()),
        }
    }

    pub async fn get_variable_string(&self, name: &str) -> Result<Zeroizing<String>, PipeError> {
        self.string(EngineRequest::GetVariableString {
            name: name.to_string(),
        })
        .await
    }

    pub async fn get_variable_version(&self, name: &str) -> Result<String, PipeError> {
        match self
            .request(&EngineRequest::GetVariableVersion {
                name: name.to_string(),
            })
            .await?
        {
            EngineResponse::Version { value } => Ok(value),
            _ => Err(unexpected()),
        }
    }

    pub async fn set_variable_numeric(&self, name: &str, value: i64) -> Result<(), PipeError> {
        self.done(EngineRequest::SetVariableNumeric {
            name: name.to_string(),
            value,
        })
        .await
    }

    pub async fn set_variable_string(
        &self,
        name: &str,
        value: Option<&str>,
        formatted: bool,
    ) -> Result<(), PipeError> {
        self.done(EngineRequest::SetVariableString {
            name: name.to_string(),
            value: value.map(str::to_string),
            formatted,
        })
        .await
    }

    pub async fn set_variable_version(
        &self,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), PipeError> {
        self.done(EngineRequest::SetVariableVersion {
            name: name.to_string(),
            value: value.map(str::to_string),
        })
        .await
    }

    pub async fn format_string(&self, input: &str) -> Result<Zeroizing<String>, PipeError> {
        self.string(EngineRequest::FormatString {
            input: input.to_string(),
        })
        .await
    }

    pub async fn escape_string(&self, input: &str) -> Result<String, PipeError> {
        let value = self
            .string(EngineRequest::EscapeString {
                input: input.to_string(),
            })
            .await?;
        Ok(value.as_str().to_string())
    }

    pub async fn evaluate_condition(&self, condition: &str) -> Result<bool, PipeError> {
        match self
            .request(&EngineRequest::EvaluateCondition {
                condition: condition.to_string(),
            })
            .await?
        {
            EngineResponse::Condition { value } => Ok(value),
            _ => Err(unexpected()),
        }
    }

    pub async fn log(&self, level: LogLevel, message: &str) -> Result<(), PipeError> {
        self.done(EngineRequest::Log {
            level,
            message: message.to_string(),
        })
        .await
    }

    pub async fn set_update_source(&self, url: &str) -> Result<(), PipeError> {
        self.done(EngineRequest::SetUpdateSource {
            url: url.to_string(),
        })
        .await
    }

    pub async fn set_local_source(
        &self,
        id: &str,
        payload_key: Option<&str>,
        path: &Path,
    ) -> Result<(), PipeError> {
        self.done(EngineRequest::SetLocalSource {
            id: id.to_string(),
            payload_key: payload_key.map(str::to_string),
            path: path.to_path_buf(),
        })
        .await
    }

    pub async fn set_download_source(
        &self,
        id: &str,
        payload_key: Option<&str>,
        source: DownloadSource,
    ) -> Result<(), PipeError> {
        self.done(EngineRequest::SetDownloadSource {
            id: id.to_string(),
            payload_key: payload_key.map(str::to_string),
            source,
        })
        .await
    }
}

/// Answers engine callbacks with an in-process application.
#[derive(Debug)]
pub struct CallbackService<A> {
    app: A,
}

impl<A: BootstrapperApplication> CallbackService<A> {
    pub fn new(app: A) -> Self {
        Self { app }
    }
}

impl<A: BootstrapperApplication> RpcService for CallbackService<A> {
    fn call<'a>(&'a mut self, message: PipeMessage) -> BoxFuture<'a, (HResult, Vec<u8>)> {
        Box::pin(async move {
            if message.message_type != MESSAGE_TYPE_BA_EVENT {
                return (HResult::E_NOTIMPL, Vec::new());
            }
            let event = match serde_json::from_slice(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "Malformed callback from engine");
                    return (HResult::INVALID_DATA, Vec::new());
                }
            };
            let reply = self.app.on_event(event).await;
            match serde_json::to_vec(&reply) {
                Ok(data) => (HResult::S_OK, data),
                Err(_) => (HResult::E_FAIL, Vec::new()),
            }
        })
    }
}

/// Answer callbacks on `channel` with `app` until the engine disconnects.
pub async fn serve_callbacks<A>(channel: &mut PipeChannel, app: A) -> Result<(), PipeError>
where
    A: BootstrapperApplication,
{
    serve_rpc(channel, &mut CallbackService::new(app)).await
}
