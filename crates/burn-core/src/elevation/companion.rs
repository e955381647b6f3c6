//! The elevated companion: runs privileged work on the engine's behalf.
//!
//! The companion connects back to the three pipes its parent created,
//! proves it was handed the secret, then serves package work on the main
//! pipe and cache work on the cache pipe until the parent sends
//! `TERMINATE`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::ElevationError;
use super::messages::{
    ElevationMessage, encode_restart, encode_status, encode_value, ui_result_from_wire,
};
use crate::BoxFuture;
use crate::apply::approved_exe::{launch, verify_secure_location};
use crate::apply::{CacheError, CacheProvider, ExecuteReporter, PackageExecutor, Registrar};
use crate::ba::events::{AllowedResults, UiResult};
use crate::hresult::HResult;
use crate::pipe::{
    CACHE_PIPE_SUFFIX, LOG_PIPE_SUFFIX, MessageHandler, NoopHandler, PipeChannel, PipeError,
    PipeMessage, PumpOutcome, connect,
};

/// Switches the companion is launched with.
pub mod switches {
    pub const SUBCOMMAND: &str = "companion";
    pub const PIPE: &str = "--pipe";
    pub const PIPE_DIRECTORY: &str = "--pipe-dir";
    pub const SECRET: &str = "--secret";
    pub const PARENT_PID: &str = "--parent-pid";
}

/// How to reach the parent.
#[derive(Clone)]
pub struct CompanionArgs {
    pub pipe: String,
    pub directory: PathBuf,
    pub secret: Zeroizing<String>,
    pub parent_pid: u32,
}

impl std::fmt::Debug for CompanionArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionArgs")
            .field("pipe", &self.pipe)
            .field("directory", &self.directory)
            .field("secret", &"[REDACTED]")
            .field("parent_pid", &self.parent_pid)
            .finish()
    }
}

impl CompanionArgs {
    /// Command line after the executable: the subcommand and its switches.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            switches::SUBCOMMAND.to_string(),
            switches::PIPE.to_string(),
            self.pipe.clone(),
            switches::PIPE_DIRECTORY.to_string(),
            self.directory.display().to_string(),
            switches::SECRET.to_string(),
            self.secret.as_str().to_string(),
            switches::PARENT_PID.to_string(),
            self.parent_pid.to_string(),
        ]
    }
}

/// The three authenticated companion pipes.
#[derive(Debug)]
pub struct CompanionPipes {
    pub main: PipeChannel,
    pub cache: PipeChannel,
    pub log: PipeChannel,
}

async fn open(args: &CompanionArgs, suffix: &str) -> Result<PipeChannel, PipeError> {
    let name = format!("{}{suffix}", args.pipe);
    let stream = connect(&args.directory, &name).await?;
    PipeChannel::new(stream, name)
        .accept_offered_secret(&args.secret, std::process::id())
        .await
}

/// Connect and authenticate all three pipes, main first.
pub async fn connect_to_parent(args: &CompanionArgs) -> Result<CompanionPipes, ElevationError> {
    let main = open(args, "").await?;
    if main.peer_pid() != args.parent_pid {
        warn!(
            expected = args.parent_pid,
            actual = main.peer_pid(),
            "Parent reported an unexpected process id"
        );
    }
    let cache = open(args, CACHE_PIPE_SUFFIX).await?;
    let log = open(args, LOG_PIPE_SUFFIX).await?;
    info!(pipe = %args.pipe, parent_pid = args.parent_pid, "Connected to parent");
    Ok(CompanionPipes { main, cache, log })
}

/// What the companion does the work with.
#[derive(Clone)]
pub struct CompanionServices {
    pub executor: Arc<dyn PackageExecutor>,
    pub cache: Arc<dyn CacheProvider>,
    pub registrar: Arc<dyn Registrar>,
    /// Roots an approved exe must live under.
    pub trusted: Vec<PathBuf>,
}

impl std::fmt::Debug for CompanionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionServices")
            .field("trusted", &self.trusted)
            .finish_non_exhaustive()
    }
}

/// How the parent ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompanionExit {
    pub exit_code: u32,
    pub restart: bool,
}

/// Sends progress and errors back to the parent over the main pipe.
struct PipeReporter<'c> {
    channel: &'c mut PipeChannel,
}

impl PipeReporter<'_> {
    async fn ask(&mut self, message: ElevationMessage) -> UiResult {
        let sent = match message.encode() {
            Ok((ty, body)) => self.channel.send_message(ty, &body, &mut NoopHandler).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(raw) => ui_result_from_wire(raw),
            Err(e) => {
                warn!(error = %e, "Parent did not answer; cancelling");
                UiResult::Cancel
            }
        }
    }
}

impl ExecuteReporter for PipeReporter<'_> {
    fn progress(&mut self, percentage: u32) -> BoxFuture<'_, UiResult> {
        Box::pin(self.ask(ElevationMessage::Progress { percentage }))
    }

    fn error<'a>(
        &'a mut self,
        code: HResult,
        message: &'a str,
        allowed: AllowedResults,
    ) -> BoxFuture<'a, UiResult> {
        Box::pin(self.ask(ElevationMessage::Error {
            code,
            message: message.to_string(),
            allowed,
        }))
    }
}

fn decode_or_reject(channel: &PipeChannel, message: &PipeMessage) -> Option<ElevationMessage> {
    match ElevationMessage::decode(message) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            warn!(
                pipe = %channel.label(),
                message_type = message.message_type,
                error = %e,
                "Rejected malformed elevation message"
            );
            None
        }
    }
}

struct MainHandler {
    services: CompanionServices,
}

impl MessageHandler for MainHandler {
    fn handle<'a>(
        &'a mut self,
        channel: &'a mut PipeChannel,
        message: PipeMessage,
    ) -> BoxFuture<'a, Result<u32, PipeError>> {
        Box::pin(async move {
            let Some(request) = decode_or_reject(channel, &message) else {
                return Ok(HResult::INVALID_DATA.as_u32());
            };
            let services = &self.services;
            let result = match request {
                ElevationMessage::ExecutePackage { operation } => {
                    debug!(?operation, "Executing elevated package");
                    let mut reporter = PipeReporter { channel };
                    encode_restart(services.executor.execute(&operation, &mut reporter).await)
                }
                ElevationMessage::BeginTransaction { boundary_id } => {
                    encode_status(services.executor.begin_transaction(&boundary_id).await)
                }
                ElevationMessage::CommitTransaction { boundary_id } => {
                    encode_restart(services.executor.commit_transaction(&boundary_id).await)
                }
                ElevationMessage::RollbackTransaction { boundary_id } => {
                    encode_status(services.executor.rollback_transaction(&boundary_id).await)
                }
                ElevationMessage::Registration { op } => {
                    encode_status(services.registrar.apply(&op).await)
                }
                ElevationMessage::LaunchApprovedExe { command } => {
                    let launched = match verify_secure_location(
                        &command.executable,
                        &command.arguments,
                        &services.trusted,
                    ) {
                        Ok(()) => launch(&command).await,
                        Err(e) => Err(e),
                    };
                    encode_value(launched.map_err(|e| {
                        warn!(id = %command.id, error = %e, "Elevated launch refused");
                        e.hresult()
                    }))
                }
                other => {
                    warn!(message_type = other.message_type(), "Unexpected message on main pipe");
                    HResult::E_NOTIMPL.as_u32()
                }
            };
            Ok(result)
        })
    }
}

struct CacheHandler {
    cache: Arc<dyn CacheProvider>,
}

impl CacheHandler {
    async fn run(&self, request: ElevationMessage) -> Result<(), CacheError> {
        let cache = &*self.cache;
        match request {
            ElevationMessage::AcquireContainer {
                container,
                source_directory,
            } => cache.acquire_container(&container, &source_directory).await,
            ElevationMessage::ExtractContainer {
                container,
                source_directory,
                payloads,
            } => {
                let refs: Vec<_> = payloads.iter().collect();
                cache
                    .extract_container(&container, &source_directory, &refs)
                    .await
            }
            ElevationMessage::AcquirePayload {
                payload,
                source_directory,
            } => cache.acquire_payload(&payload, &source_directory).await,
            ElevationMessage::CachePayload {
                package_id,
                payload,
            } => cache.cache_payload(&package_id, &payload).await,
            ElevationMessage::LayoutPayload { payload, directory } => {
                cache.layout_payload(&payload, &directory).await
            }
            ElevationMessage::LayoutBundle { directory } => cache.layout_bundle(&directory).await,
            ElevationMessage::RemovePackage { package_id } => {
                cache.remove_package(&package_id).await
            }
            other => {
                warn!(message_type = other.message_type(), "Unexpected message on cache pipe");
                Err(CacheError::Remote(HResult::E_NOTIMPL))
            }
        }
    }
}

impl MessageHandler for CacheHandler {
    fn handle<'a>(
        &'a mut self,
        channel: &'a mut PipeChannel,
        message: PipeMessage,
    ) -> BoxFuture<'a, Result<u32, PipeError>> {
        Box::pin(async move {
            let Some(request) = decode_or_reject(channel, &message) else {
                return Ok(HResult::INVALID_DATA.as_u32());
            };
            let result = self.run(request).await.map_err(|e| {
                warn!(error = %e, "Elevated cache operation failed");
                e.hresult()
            });
            Ok(encode_status(result))
        })
    }
}

/// How long the cache pipe gets to see its own `TERMINATE` after the main
/// pipe ended.
const CACHE_DRAIN: Duration = Duration::from_secs(5);

/// Serve the main and cache pipes until the parent terminates the session.
///
/// A parent that disconnects without terminating ends the session with
/// `ERROR_INSTALL_FAILURE`.
pub async fn serve(
    mut main: PipeChannel,
    mut cache: PipeChannel,
    services: CompanionServices,
) -> Result<CompanionExit, ElevationError> {
    let mut cache_handler = CacheHandler {
        cache: Arc::clone(&services.cache),
    };
    let mut cache_task =
        tokio::spawn(async move { cache.pump_messages(&mut cache_handler).await });

    let mut main_handler = MainHandler { services };
    let outcome = main.pump_messages(&mut main_handler).await;

    match tokio::time::timeout(CACHE_DRAIN, &mut cache_task).await {
        Ok(Ok(Ok(cache_outcome))) => debug!(?cache_outcome, "Cache pipe finished"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Cache pipe failed"),
        Ok(Err(e)) => warn!(error = %e, "Cache pipe task failed"),
        Err(_) => {
            warn!("Cache pipe still open after the session ended");
            cache_task.abort();
        }
    }

    let exit = match outcome? {
        PumpOutcome::Terminate { exit_code, restart } => CompanionExit { exit_code, restart },
        PumpOutcome::Complete(_) | PumpOutcome::Disconnected => {
            warn!("Parent went away without terminating the companion");
            CompanionExit {
                exit_code: HResult::INSTALL_FAILURE.win32_code().unwrap_or(1603),
                restart: false,
            }
        }
    };
    info!(exit_code = exit.exit_code, restart = exit.restart, "Companion session ended");
    Ok(exit)
}
