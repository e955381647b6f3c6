//! Engine side of the elevated companion.
//!
//! [`ElevatedCompanion`] stands in for the local executor, cache and
//! registrar once the engine has elevated: every call becomes a message on
//! the companion's main or cache pipe, answered with a packed `COMPLETE`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::companion::CompanionArgs;
use super::messages::{
    ElevationMessage, decode_restart, decode_status, decode_value, ui_result_to_wire,
};
use super::{ElevationError, ElevationOptions};
use crate::BoxFuture;
use crate::apply::{
    CacheError, CacheProvider, ExecuteReporter, FileCache, LaunchCommand, PackageExecutor,
    PackageOperation, Registrar, RegistrationOp,
};
use crate::hresult::HResult;
use crate::model::{Container, Payload, Restart};
use crate::pipe::process::wait_for_exit;
use crate::pipe::{
    CACHE_PIPE_SUFFIX, ExitWait, LOG_PIPE_SUFFIX, MessageHandler, NoopHandler, PipeChannel,
    PipeError, PipeListener, PipeMessage, PumpOutcome, wait_for_client,
};
use crate::security::{generate_pipe_name, generate_secret};

/// A connected companion and the pipes to it.
pub struct ElevatedCompanion {
    main: Mutex<PipeChannel>,
    cache: Mutex<PipeChannel>,
    log_task: JoinHandle<()>,
    child: Option<Child>,
    directories: FileCache,
    transactions: bool,
    terminate_timeout: Duration,
}

impl std::fmt::Debug for ElevatedCompanion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElevatedCompanion")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("transactions", &self.transactions)
            .finish_non_exhaustive()
    }
}

/// Forwards the companion's progress and error messages to the local
/// reporter while a package runs.
struct ReporterRelay<'a> {
    reporter: &'a mut dyn ExecuteReporter,
}

impl MessageHandler for ReporterRelay<'_> {
    fn handle<'a>(
        &'a mut self,
        channel: &'a mut PipeChannel,
        message: PipeMessage,
    ) -> BoxFuture<'a, Result<u32, PipeError>> {
        Box::pin(async move {
            let answer = match ElevationMessage::decode(&message) {
                Ok(ElevationMessage::Progress { percentage }) => {
                    self.reporter.progress(percentage).await
                }
                Ok(ElevationMessage::Error {
                    code,
                    message,
                    allowed,
                }) => self.reporter.error(code, &message, allowed).await,
                Ok(other) => {
                    warn!(
                        pipe = %channel.label(),
                        message_type = other.message_type(),
                        "Companion sent an unexpected request"
                    );
                    return Ok(HResult::E_NOTIMPL.as_u32());
                }
                Err(e) => {
                    warn!(pipe = %channel.label(), error = %e, "Malformed companion message");
                    return Ok(HResult::INVALID_DATA.as_u32());
                }
            };
            Ok(ui_result_to_wire(answer))
        })
    }
}

fn rejected(e: &PipeError) -> HResult {
    warn!(error = %e, "Companion request failed");
    e.hresult()
}

async fn accept(
    listener: &mut PipeListener,
    child: &mut Child,
    options: &ElevationOptions,
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
        .offer_secret(secret, std::process::id())
        .await
}

fn spawn_log_pump(mut log: PipeChannel) -> JoinHandle<()> {
    tokio::spawn(async move {
        match log.pump_messages(&mut NoopHandler).await {
            Ok(PumpOutcome::Disconnected) => debug!("Companion log pipe closed"),
            Ok(outcome) => debug!(?outcome, "Companion log pipe ended"),
            Err(e) => debug!(error = %e, "Companion log pipe failed"),
        }
    })
}

impl ElevatedCompanion {
    /// Start the companion through the configured launcher and connect all
    /// three pipes.
    pub async fn launch(options: &ElevationOptions) -> Result<Self, ElevationError> {
        let pipe = generate_pipe_name();
        let secret = generate_secret();
        let mut main = PipeListener::bind(&options.directory, &pipe)?;
        let mut cache = PipeListener::bind(&options.directory, &format!("{pipe}{CACHE_PIPE_SUFFIX}"))?;
        let mut log = PipeListener::bind(&options.directory, &format!("{pipe}{LOG_PIPE_SUFFIX}"))?;

        let companion_exe = options.companion_exe()?;
        let args = CompanionArgs {
            pipe,
            directory: options.directory.clone(),
            secret,
            parent_pid: std::process::id(),
        };
        let (program, prefix) = match options.launcher.split_first() {
            Some((program, rest)) => (PathBuf::from(program), rest.to_vec()),
            None => (companion_exe.clone(), Vec::new()),
        };
        let mut command = Command::new(&program);
        command.args(&prefix);
        if !options.launcher.is_empty() {
            command.arg(&companion_exe);
        }
        let mut child = command
            .args(args.to_args())
            .args(&options.extra_args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ElevationError::Spawn {
                program: program.clone(),
                source,
            })?;
        info!(
            program = %program.display(),
            companion = %companion_exe.display(),
            pid = child.id().unwrap_or_default(),
            pipe = %args.pipe,
            "Started elevated companion"
        );

        let main = accept(&mut main, &mut child, options, &args.secret).await?;
        let cache = accept(&mut cache, &mut child, options, &args.secret).await?;
        let log = accept(&mut log, &mut child, options, &args.secret).await?;

        let mut companion = Self::from_channels(main, cache, log, options);
        companion.child = Some(child);
        Ok(companion)
    }

    /// Wrap already-authenticated pipes to a companion this process did not
    /// spawn.
    pub fn from_channels(
        main: PipeChannel,
        cache: PipeChannel,
        log: PipeChannel,
        options: &ElevationOptions,
    ) -> Self {
        Self {
            main: Mutex::new(main),
            cache: Mutex::new(cache),
            log_task: spawn_log_pump(log),
            child: None,
            directories: FileCache::new(&options.cache_root),
            transactions: options.transactions,
            terminate_timeout: options.terminate_timeout,
        }
    }

    async fn send_main<H>(&self, message: &ElevationMessage, handler: &mut H) -> Result<u32, HResult>
    where
        H: MessageHandler + ?Sized,
    {
        let (ty, body) = message.encode().map_err(|e| rejected(&e))?;
        let mut main = self.main.lock().await;
        main.send_message(ty, &body, handler)
            .await
            .map_err(|e| rejected(&e))
    }

    async fn send_cache(&self, message: ElevationMessage) -> Result<(), CacheError> {
        let (ty, body) = message
            .encode()
            .map_err(|e| CacheError::Remote(rejected(&e)))?;
        let raw = {
            let mut cache = self.cache.lock().await;
            cache
                .send_message(ty, &body, &mut NoopHandler)
                .await
                .map_err(|e| CacheError::Remote(rejected(&e)))?
        };
        decode_status(raw).map_err(CacheError::Remote)
    }

    /// Launch an approved exe from the companion. Returns its process id.
    pub async fn launch_approved_exe(&self, command: &LaunchCommand) -> Result<u32, HResult> {
        let message = ElevationMessage::LaunchApprovedExe {
            command: command.clone(),
        };
        decode_value(self.send_main(&message, &mut NoopHandler).await?)
    }

    /// End the session and wait for the companion to exit.
    pub async fn terminate(mut self, exit_code: u32, restart: bool) -> Result<(), ElevationError> {
        if let Err(e) = self.cache.get_mut().write_terminate(exit_code, restart).await {
            debug!(error = %e, "Companion cache pipe already closed");
        }
        if let Err(e) = self.main.get_mut().write_terminate(exit_code, restart).await {
            debug!(error = %e, "Companion main pipe already closed");
        }

        if let Some(mut child) = self.child.take() {
            match wait_for_exit(&mut child, self.terminate_timeout).await? {
                ExitWait::Exited(code) => check_exit_code(exit_code, code),
                ExitWait::TimedOut => {
                    warn!(timeout = ?self.terminate_timeout, "Companion did not exit; killing it");
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill companion");
                    }
                }
            }
        }

        if tokio::time::timeout(Duration::from_secs(1), &mut self.log_task)
            .await
            .is_err()
        {
            self.log_task.abort();
        }
        info!(exit_code, restart, "Elevated companion terminated");
        Ok(())
    }
}

/// The companion exits with the code it was terminated with. Only the low
/// byte survives on Unix.
fn check_exit_code(expected: u32, actual: Option<i32>) {
    if !cfg!(debug_assertions) {
        return;
    }
    let expected = if cfg!(unix) { expected & 0xFF } else { expected };
    let matches = actual.is_some_and(|code| code as u32 == expected);
    if !matches {
        warn!(expected, ?actual, "Companion exited with an unexpected code");
    }
}

impl Drop for ElevatedCompanion {
    fn drop(&mut self) {
        self.log_task.abort();
    }
}

impl PackageExecutor for ElevatedCompanion {
    fn execute<'a>(
        &'a self,
        operation: &'a PackageOperation,
        reporter: &'a mut dyn ExecuteReporter,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        Box::pin(async move {
            let message = ElevationMessage::ExecutePackage {
                operation: operation.clone(),
            };
            let mut relay = ReporterRelay { reporter };
            decode_restart(self.send_main(&message, &mut relay).await?)
        })
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    fn begin_transaction<'a>(&'a self, boundary_id: &'a str) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            let message = ElevationMessage::BeginTransaction {
                boundary_id: boundary_id.to_string(),
            };
            decode_status(self.send_main(&message, &mut NoopHandler).await?)
        })
    }

    fn commit_transaction<'a>(
        &'a self,
        boundary_id: &'a str,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        Box::pin(async move {
            let message = ElevationMessage::CommitTransaction {
                boundary_id: boundary_id.to_string(),
            };
            decode_restart(self.send_main(&message, &mut NoopHandler).await?)
        })
    }

    fn rollback_transaction<'a>(
        &'a self,
        boundary_id: &'a str,
    ) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            let message = ElevationMessage::RollbackTransaction {
                boundary_id: boundary_id.to_string(),
            };
            decode_status(self.send_main(&message, &mut NoopHandler).await?)
        })
    }
}

impl CacheProvider for ElevatedCompanion {
    fn package_directory(&self, package_id: &str) -> PathBuf {
        self.directories.package_directory(package_id)
    }

    fn acquire_container<'a>(
        &'a self,
        container: &'a Container,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::AcquireContainer {
            container: container.clone(),
            source_directory: source_directory.to_path_buf(),
        }))
    }

    fn extract_container<'a>(
        &'a self,
        container: &'a Container,
        source_directory: &'a Path,
        payloads: &'a [&'a Payload],
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::ExtractContainer {
            container: container.clone(),
            source_directory: source_directory.to_path_buf(),
            payloads: payloads.iter().map(|p| (*p).clone()).collect(),
        }))
    }

    fn acquire_payload<'a>(
        &'a self,
        payload: &'a Payload,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::AcquirePayload {
            payload: payload.clone(),
            source_directory: source_directory.to_path_buf(),
        }))
    }

    fn cache_payload<'a>(
        &'a self,
        package_id: &'a str,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::CachePayload {
            package_id: package_id.to_string(),
            payload: payload.clone(),
        }))
    }

    fn layout_payload<'a>(
        &'a self,
        payload: &'a Payload,
        directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::LayoutPayload {
            payload: payload.clone(),
            directory: directory.to_path_buf(),
        }))
    }

    fn layout_bundle<'a>(&'a self, directory: &'a Path) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::LayoutBundle {
            directory: directory.to_path_buf(),
        }))
    }

    fn remove_package<'a>(&'a self, package_id: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.send_cache(ElevationMessage::RemovePackage {
            package_id: package_id.to_string(),
        }))
    }
}

impl Registrar for ElevatedCompanion {
    fn apply<'a>(&'a self, op: &'a RegistrationOp) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            let message = ElevationMessage::Registration { op: op.clone() };
            decode_status(self.send_main(&message, &mut NoopHandler).await?)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex as StdMutex, PoisonError};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::apply::OperationKind;
    use crate::model::ActionState;
    use crate::ba::events::{AllowedResults, UiResult};
    use crate::elevation::companion::{CompanionExit, CompanionServices, serve};
    use crate::pipe::channel::test_support::channel_pair;

    #[derive(Default)]
    struct RecordingExecutor {
        answers: StdMutex<Vec<UiResult>>,
    }

    impl PackageExecutor for RecordingExecutor {
        fn execute<'a>(
            &'a self,
            operation: &'a PackageOperation,
            reporter: &'a mut dyn ExecuteReporter,
        ) -> BoxFuture<'a, Result<Restart, HResult>> {
            Box::pin(async move {
                let progress = reporter.progress(50).await;
                let error = reporter
                    .error(HResult::E_FAIL, "disk full", AllowedResults::RetryCancel)
                    .await;
                self.answers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend([progress, error]);
                if operation.package_id == "Broken" {
                    Err(HResult::INSTALL_FAILURE)
                } else {
                    Ok(Restart::Required)
                }
            })
        }

        fn supports_transactions(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingCache {
        removed: StdMutex<Vec<String>>,
    }

    impl CacheProvider for RecordingCache {
        fn package_directory(&self, package_id: &str) -> PathBuf {
            PathBuf::from("/cache").join(package_id)
        }

        fn acquire_container<'a>(
            &'a self,
            _container: &'a Container,
            _source_directory: &'a Path,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async { Ok(()) })
        }

        fn extract_container<'a>(
            &'a self,
            _container: &'a Container,
            _source_directory: &'a Path,
            _payloads: &'a [&'a Payload],
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async { Ok(()) })
        }

        fn acquire_payload<'a>(
            &'a self,
            payload: &'a Payload,
            _source_directory: &'a Path,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async move {
                Err(CacheError::NotAcquired(payload.key.clone()))
            })
        }

        fn cache_payload<'a>(
            &'a self,
            _package_id: &'a str,
            _payload: &'a Payload,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async { Ok(()) })
        }

        fn layout_payload<'a>(
            &'a self,
            _payload: &'a Payload,
            _directory: &'a Path,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async { Ok(()) })
        }

        fn layout_bundle<'a>(&'a self, _directory: &'a Path) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async { Ok(()) })
        }

        fn remove_package<'a>(&'a self, package_id: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async move {
                self.removed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(package_id.to_string());
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct RecordingRegistrar {
        ops: StdMutex<Vec<RegistrationOp>>,
    }

    impl Registrar for RecordingRegistrar {
        fn apply<'a>(&'a self, op: &'a RegistrationOp) -> BoxFuture<'a, Result<(), HResult>> {
            Box::pin(async move {
                self.ops
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(op.clone());
                Ok(())
            })
        }
    }

    /// Answers progress with `NoAction` and errors with `Retry`.
    struct RetryReporter {
        progress: Vec<u32>,
    }

    impl ExecuteReporter for RetryReporter {
        fn progress(&mut self, percentage: u32) -> BoxFuture<'_, UiResult> {
            self.progress.push(percentage);
            Box::pin(async { UiResult::NoAction })
        }

        fn error<'a>(
            &'a mut self,
            _code: HResult,
            _message: &'a str,
            _allowed: AllowedResults,
        ) -> BoxFuture<'a, UiResult> {
            Box::pin(async { UiResult::Retry })
        }
    }

    struct Harness {
        proxy: ElevatedCompanion,
        executor: Arc<RecordingExecutor>,
        cache: Arc<RecordingCache>,
        registrar: Arc<RecordingRegistrar>,
        companion: JoinHandle<Result<CompanionExit, ElevationError>>,
    }

    fn harness() -> Harness {
        let (engine_main, companion_main) = channel_pair();
        let (engine_cache, companion_cache) = channel_pair();
        let (engine_log, _companion_log) = channel_pair();
        let executor = Arc::new(RecordingExecutor::default());
        let cache = Arc::new(RecordingCache::default());
        let registrar = Arc::new(RecordingRegistrar::default());
        let services = CompanionServices {
            executor: executor.clone(),
            cache: cache.clone(),
            registrar: registrar.clone(),
            trusted: Vec::new(),
        };
        let companion = tokio::spawn(serve(companion_main, companion_cache, services));
        let mut options = ElevationOptions::for_tests(PathBuf::from("/machine"));
        options.transactions = true;
        Harness {
            proxy: ElevatedCompanion::from_channels(engine_main, engine_cache, engine_log, &options),
            executor,
            cache,
            registrar,
            companion,
        }
    }

    fn operation(package_id: &str) -> PackageOperation {
        PackageOperation {
            package_id: package_id.to_string(),
            kind: OperationKind::Exe,
            action: ActionState::Install,
            rollback: false,
            per_machine: true,
            executable: None,
            arguments: String::new(),
            log_arguments: String::new(),
            features: Vec::new(),
            slipstream: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_execute_relays_progress_and_errors() {
        let h = harness();
        let mut reporter = RetryReporter {
            progress: Vec::new(),
        };
        let restart = h.proxy.execute(&operation("App"), &mut reporter).await;
        assert_eq!(restart, Ok(Restart::Required));
        assert_eq!(reporter.progress, vec![50]);
        assert_eq!(
            *h.executor.answers.lock().unwrap(),
            vec![UiResult::NoAction, UiResult::Retry]
        );

        let failed = h.proxy.execute(&operation("Broken"), &mut reporter).await;
        assert_eq!(failed, Err(HResult::INSTALL_FAILURE));
        assert!(h.proxy.supports_transactions());

        h.proxy.terminate(0, false).await.unwrap();
        let exit = h.companion.await.unwrap().unwrap();
        assert_eq!(exit.exit_code, 0);
        assert!(!exit.restart);
    }

    #[tokio::test]
    async fn test_cache_and_registration_are_forwarded() {
        let h = harness();
        h.proxy.remove_package("App").await.unwrap();
        assert_eq!(*h.cache.removed.lock().unwrap(), vec!["App".to_string()]);
        assert_eq!(
            h.proxy.package_directory("App"),
            FileCache::new("/machine").package_directory("App")
        );

        let payload = Payload {
            key: "app.msi".into(),
            file_path: PathBuf::from("app.msi"),
            packaging: Default::default(),
            container: None,
            verification: Default::default(),
            size: 0,
            download: None,
            layout_only: false,
            ux: false,
        };
        let err = h
            .proxy
            .acquire_payload(&payload, Path::new("/src"))
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HResult::NOT_FOUND);

        let op = RegistrationOp::UnregisterProvider {
            package_id: "App".into(),
            provider_key: "app".into(),
        };
        h.proxy.apply(&op).await.unwrap();
        assert_eq!(*h.registrar.ops.lock().unwrap(), vec![op]);

        h.proxy.terminate(1603, true).await.unwrap();
        let exit = h.companion.await.unwrap().unwrap();
        assert_eq!(exit.exit_code, 1603);
        assert!(exit.restart);
    }

    #[tokio::test]
    async fn test_untrusted_approved_exe_is_refused() {
        let h = harness();
        let command = LaunchCommand {
            id: "Tool".into(),
            executable: PathBuf::from("/tmp/tool"),
            arguments: String::new(),
            log_arguments: String::new(),
            wait: Duration::ZERO,
        };
        assert_eq!(
            h.proxy.launch_approved_exe(&command).await,
            Err(HResult::E_ACCESSDENIED)
        );
        h.proxy.terminate(0, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_disconnect_ends_companion_with_failure() {
        let h = harness();
        drop(h.proxy);
        let exit = h.companion.await.unwrap().unwrap();
        assert_eq!(exit.exit_code, 1603);
    }
}
