//! The engine context: everything one engine run owns, and the loop that
//! drains the application's action queue.
//!
//! ```text
//! Startup ─▶ [Detect] ─▶ [Plan] ─▶ [Elevate] ─▶ [Apply] ─▶ Quit ─▶ Shutdown
//!              ▲  queued by the application, run one at a time  │
//!              └──────────────────── reload ◀──────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use burn_config::EngineConfig;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::apply::approved_exe::prepare_launch;
use crate::apply::{
    self, ApplyContext, ApplyResult, CacheProvider, CommandLineExecutor, ExecuteReporter,
    FileCache, PackageExecutor, PackageOperation, Registrar,
};
use crate::ba::api::apply_source_changes;
use crate::ba::{
    ActionQueue, AllowedResults, BaCommand, BaEvent, BaHost, BootstrapperApplication, EngineAction,
    EngineActivity, EngineApi, ErrorType, HostError, HostOptions, PassiveBa, PendingSources,
    UiResult,
};
use crate::detect::{self, DetectError, RegistrationProbe, SystemSnapshot};
use crate::elevation::{self, ElevatedCompanion, ElevationError, ElevationOptions};
use crate::hresult::HResult;
use crate::model::{BundleAction, BundleModel, ModelError, Restart};
use crate::plan::{self, Plan, PlanRequest};
use crate::variables::{self, SharedVariables, VariableError, Variables, names};
use crate::variant::Variant;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Elevation(#[from] ElevationError),
}

impl EngineError {
    pub fn hresult(&self) -> HResult {
        match self {
            EngineError::Model(_) => HResult::INVALID_DATA,
            EngineError::Variable(e) => e.hresult(),
            EngineError::Detect(e) => e.hresult(),
            EngineError::Host(e) => e.hresult(),
            EngineError::Elevation(e) => e.hresult(),
        }
    }
}

/// The services the engine uses while unelevated.
#[derive(Clone)]
pub struct LocalServices {
    pub probe: Arc<dyn RegistrationProbe>,
    pub executor: Arc<dyn PackageExecutor>,
    pub cache: Arc<dyn CacheProvider>,
    pub registrar: Arc<dyn Registrar>,
}

impl LocalServices {
    /// Command-line executor, file cache under `[cache] root`, and an
    /// in-memory snapshot for registration.
    pub fn from_config(config: &EngineConfig, snapshot: Arc<SystemSnapshot>) -> Self {
        Self {
            probe: snapshot.clone(),
            executor: Arc::new(CommandLineExecutor::new()),
            cache: Arc::new(FileCache::new(&config.cache.root)),
            registrar: snapshot,
        }
    }
}

impl std::fmt::Debug for LocalServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalServices").finish_non_exhaustive()
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    pub exit_code: u32,
    pub restart: Restart,
}

/// Runs per-machine packages in the companion and per-user packages
/// locally.
struct RoutedExecutor<'a> {
    local: &'a dyn PackageExecutor,
    elevated: Option<&'a ElevatedCompanion>,
}

impl RoutedExecutor<'_> {
    fn target(&self, per_machine: bool) -> &dyn PackageExecutor {
        match self.elevated {
            Some(companion) if per_machine => companion,
            _ => self.local,
        }
    }
}

impl PackageExecutor for RoutedExecutor<'_> {
    fn execute<'a>(
        &'a self,
        operation: &'a PackageOperation,
        reporter: &'a mut dyn ExecuteReporter,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        self.target(operation.per_machine).execute(operation, reporter)
    }

    fn supports_transactions(&self) -> bool {
        self.target(true).supports_transactions()
    }

    fn begin_transaction<'a>(&'a self, boundary_id: &'a str) -> BoxFuture<'a, Result<(), HResult>> {
        self.target(true).begin_transaction(boundary_id)
    }

    fn commit_transaction<'a>(
        &'a self,
        boundary_id: &'a str,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        self.target(true).commit_transaction(boundary_id)
    }

    fn rollback_transaction<'a>(
        &'a self,
        boundary_id: &'a str,
    ) -> BoxFuture<'a, Result<(), HResult>> {
        self.target(true).rollback_transaction(boundary_id)
    }
}

/// Everything one engine run owns.
pub struct EngineContext {
    config: EngineConfig,
    model: BundleModel,
    variables: SharedVariables,
    command: BaCommand,
    services: LocalServices,
    elevation: ElevationOptions,
    companion: Option<ElevatedCompanion>,
    queue: Arc<ActionQueue>,
    activity: Arc<EngineActivity>,
    sources: PendingSources,
    plan: Option<Plan>,
    last_apply: Option<ApplyResult>,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("bundle", &self.model.bundle.id)
            .field("command", &self.command)
            .field("elevated", &self.companion.is_some())
            .field("planned", &self.plan.as_ref().map(|p| p.action))
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Seed the variables and build the context for one run.
    pub fn new(
        model: BundleModel,
        config: EngineConfig,
        command: BaCommand,
        services: LocalServices,
    ) -> Result<Self, EngineError> {
        let mut vars = Variables::new();
        vars.initialize_system()?;
        model.initialize_variables(&mut vars)?;
        vars.set_built_in(names::BUNDLE_ELEVATED, Variant::numeric(0))?;
        let elevation = ElevationOptions::from_config(&config);
        Ok(Self {
            config,
            model,
            variables: variables::shared(vars),
            command,
            services,
            elevation,
            companion: None,
            queue: Arc::new(ActionQueue::new()),
            activity: Arc::new(EngineActivity::new()),
            sources: Arc::new(Mutex::new(Vec::new())),
            plan: None,
            last_apply: None,
        })
    }

    /// Replace how the companion is started.
    pub fn with_elevation(mut self, options: ElevationOptions) -> Self {
        self.elevation = options;
        self
    }

    pub fn model(&self) -> &BundleModel {
        &self.model
    }

    pub fn variables(&self) -> &SharedVariables {
        &self.variables
    }

    /// The plan waiting to be applied.
    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn last_apply(&self) -> Option<ApplyResult> {
        self.last_apply
    }

    pub fn queue(&self) -> Arc<ActionQueue> {
        Arc::clone(&self.queue)
    }

    pub fn is_elevated(&self) -> bool {
        self.companion.is_some()
    }

    /// Request handler for an application session.
    pub fn api(&self) -> EngineApi {
        EngineApi::new(
            &self.model,
            Arc::clone(&self.queue),
            Arc::clone(&self.activity),
            Arc::clone(&self.variables),
            Arc::clone(&self.sources),
        )
    }

    fn command_action(&self) -> BundleAction {
        self.command.action.unwrap_or(BundleAction::Install)
    }

    pub async fn detect(&mut self, ba: &dyn BootstrapperApplication) -> HResult {
        let action = self.command_action();
        self.plan = None;
        match detect::detect(
            &mut self.model,
            &self.variables,
            ba,
            self.services.probe.as_ref(),
            action,
        )
        .await
        {
            Ok(()) => HResult::S_OK,
            Err(e) => e.hresult(),
        }
    }

    fn plan_request(&self, action: BundleAction) -> PlanRequest {
        let mut request = PlanRequest::new(action);
        request.relation_type = self.command.relation_type;
        request.parent = switch_value(&self.command.arguments, "-parent");
        if action == BundleAction::Layout {
            request.layout_directory = self.layout_directory();
        }
        request
    }

    fn layout_directory(&self) -> Option<PathBuf> {
        let mut vars = variables::lock(&self.variables).ok()?;
        if !vars.contains(names::BUNDLE_LAYOUT_DIRECTORY) {
            return switch_value(&self.command.arguments, "-layout").map(PathBuf::from);
        }
        vars.get_formatted(names::BUNDLE_LAYOUT_DIRECTORY)
            .ok()
            .map(|dir| PathBuf::from(dir.as_str()))
    }

    pub async fn plan_action(
        &mut self,
        ba: &dyn BootstrapperApplication,
        action: BundleAction,
    ) -> HResult {
        let request = self.plan_request(action);
        self.plan = None;
        match plan::plan(&mut self.model, &self.variables, ba, &request).await {
            Ok(plan) => {
                self.plan = Some(plan);
                HResult::S_OK
            }
            Err(e) => e.hresult(),
        }
    }

    /// Start the companion, asking the application how to proceed when it
    /// fails. A running companion is reported as `ALREADY_INITIALIZED`
    /// without starting another.
    pub async fn elevate(&mut self, ba: &dyn BootstrapperApplication) -> HResult {
        if self.companion.is_some() {
            debug!("Already elevated");
            let status = ElevationError::AlreadyElevated.hresult();
            ba.on_event(BaEvent::ElevateComplete { status }).await;
            return status;
        }
        if ba.on_event(BaEvent::ElevateBegin).await.wants_cancel() {
            ba.on_event(BaEvent::ElevateComplete {
                status: HResult::INSTALL_USEREXIT,
            })
            .await;
            return HResult::INSTALL_USEREXIT;
        }

        let status = loop {
            match elevation::elevate(&mut self.companion, &self.elevation).await {
                Ok(_) | Err(ElevationError::AlreadyElevated) => break HResult::S_OK,
                Err(e) => {
                    warn!(error = %e, "Elevation failed");
                    let code = e.hresult();
                    let reply = ba
                        .on_event(BaEvent::Error {
                            error_type: ErrorType::Elevate,
                            package_id: None,
                            code,
                            message: e.to_string(),
                            allowed: AllowedResults::RetryCancel,
                            data: Vec::new(),
                        })
                        .await;
                    if reply.result.filter(AllowedResults::RetryCancel) != UiResult::Retry {
                        break code;
                    }
                    info!("Retrying elevation");
                }
            }
        };

        if status.is_success() {
            match variables::lock(&self.variables) {
                Ok(mut vars) => {
                    if let Err(e) = vars.set_built_in(names::BUNDLE_ELEVATED, Variant::numeric(1)) {
                        warn!(error = %e, "Failed to publish elevation");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to publish elevation"),
            }
        }
        ba.on_event(BaEvent::ElevateComplete { status }).await;
        status
    }

    /// Apply the current plan. The plan is consumed; apply again only after
    /// planning again.
    pub async fn apply(&mut self, ba: &dyn BootstrapperApplication) -> HResult {
        let Some(plan) = self.plan.take() else {
            warn!("Apply requested without a plan");
            return HResult::INVALID_STATE;
        };
        if plan.needs_elevation() && self.companion.is_none() {
            let status = self.elevate(ba).await;
            if status.is_failure() {
                ba.on_event(BaEvent::ApplyComplete {
                    status,
                    restart: Restart::None,
                })
                .await;
                return status;
            }
        }

        let executor = RoutedExecutor {
            local: self.services.executor.as_ref(),
            elevated: self.companion.as_ref(),
        };
        let per_machine = self.model.bundle.per_machine;
        let (cache, registrar): (&dyn CacheProvider, &dyn Registrar) = match &self.companion {
            Some(companion) if per_machine => (companion, companion),
            _ => (
                self.services.cache.as_ref(),
                self.services.registrar.as_ref(),
            ),
        };
        let ctx = ApplyContext {
            model: &self.model,
            variables: &self.variables,
            ba,
            executor: &executor,
            cache,
            registrar,
        };
        let result = apply::apply(&ctx, &plan).await;
        self.last_apply = Some(result);
        result.status
    }

    /// Resolve and launch an approved exe, elevating first when needed.
    pub async fn launch_approved_exe(
        &mut self,
        ba: &dyn BootstrapperApplication,
        id: &str,
        arguments: Option<&str>,
        wait: Option<Duration>,
    ) -> HResult {
        ba.on_event(BaEvent::LaunchApprovedExeBegin).await;
        let wait = wait.unwrap_or(Duration::from_millis(
            self.config.ba.approved_exe_input_idle_ms,
        ));
        let result = match self.resolve_launch(id, arguments, wait) {
            Ok(command) => {
                let status = self.elevate(ba).await;
                match &self.companion {
                    Some(companion) if status.is_success() => {
                        companion.launch_approved_exe(&command).await
                    }
                    _ => Err(status),
                }
            }
            Err(hr) => Err(hr),
        };
        let (status, process_id) = match result {
            Ok(pid) => (HResult::S_OK, pid),
            Err(hr) => {
                warn!(id, %hr, "Approved exe launch failed");
                (hr, 0)
            }
        };
        ba.on_event(BaEvent::LaunchApprovedExeComplete { status, process_id })
            .await;
        status
    }

    fn resolve_launch(
        &self,
        id: &str,
        arguments: Option<&str>,
        wait: Duration,
    ) -> Result<crate::apply::LaunchCommand, HResult> {
        let mut vars = variables::lock(&self.variables).map_err(|e| e.hresult())?;
        prepare_launch(&self.model, &mut vars, id, arguments, wait).map_err(|e| e.hresult())
    }

    /// Drain the action queue until the application quits. Returns the
    /// quit exit code.
    pub async fn run_loop(&mut self, ba: &dyn BootstrapperApplication) -> u32 {
        loop {
            let action = self.queue.next().await;
            let activity = Arc::clone(&self.activity);
            let _active = activity.activate();
            apply_source_changes(&self.sources, &mut self.model);
            debug!(action = action.name(), "Running engine action");

            match action {
                EngineAction::Detect => {
                    self.detect(ba).await;
                }
                EngineAction::Plan(action) => {
                    self.plan_action(ba, action).await;
                }
                EngineAction::Elevate => {
                    self.elevate(ba).await;
                }
                EngineAction::Apply => {
                    self.apply(ba).await;
                }
                EngineAction::LaunchApprovedExe {
                    id,
                    arguments,
                    wait,
                } => {
                    self.launch_approved_exe(ba, &id, arguments.as_deref(), wait)
                        .await;
                }
                EngineAction::Quit(exit_code) => {
                    self.queue.mark_quitting();
                    info!(exit_code, "Application quit");
                    return exit_code;
                }
            }
        }
    }

    /// One application session: startup, the action loop, shutdown.
    /// Returns the exit code and whether the application asked to reload.
    async fn session(&mut self, ba: &dyn BootstrapperApplication) -> (u32, bool) {
        self.queue.reset();
        ba.on_event(BaEvent::Startup).await;
        let exit_code = self.run_loop(ba).await;
        let reply = ba.on_event(BaEvent::Shutdown).await;
        (exit_code, reply.reload)
    }

    /// Run to completion with the configured application, or the built-in
    /// passive one when none is configured or the command asks for it.
    pub async fn run(mut self) -> Result<EngineExit, EngineError> {
        let result = match self.config.ba.path.clone() {
            Some(path) if !self.command.passive => self.run_hosted(path).await,
            _ => Ok(self.run_passive().await),
        };
        let exit_code = result.as_ref().map_or_else(|e| e.hresult().as_u32(), |c| *c);
        let restart = self.last_apply.map(|r| r.restart).unwrap_or_default();

        if let Some(companion) = self.companion.take()
            && let Err(e) = companion
                .terminate(exit_code, restart >= Restart::Required)
                .await
        {
            warn!(error = %e, "Failed to terminate companion");
        }
        let exit_code = result?;
        info!(exit_code, ?restart, "Engine finished");
        Ok(EngineExit { exit_code, restart })
    }

    async fn run_passive(&mut self) -> u32 {
        let ba = PassiveBa::new(self.queue(), self.command_action());
        let (exit_code, _) = self.session(&ba).await;
        exit_code
    }

    async fn run_hosted(&mut self, primary: PathBuf) -> Result<u32, EngineError> {
        let options = HostOptions::from_config(&self.config.pipe);
        let mut path = primary;
        let mut fallback_started = false;
        loop {
            let host = BaHost::start(&path, &self.command, self.api(), &options).await?;
            let ba = host.application();
            let (exit_code, reload) = self.session(ba.as_ref()).await;
            drop(ba);
            let outcome = host.stop(reload).await?;

            if outcome.reload {
                info!(path = %path.display(), "Reloading bootstrapper application");
                continue;
            }
            if outcome.fallback
                && !fallback_started
                && let Some(prerequisite) = self.config.ba.prerequisite_path.clone()
            {
                warn!(
                    path = %path.display(),
                    fallback = %prerequisite.display(),
                    "Application failed; starting the prerequisite application"
                );
                path = prerequisite;
                fallback_started = true;
                continue;
            }
            return Ok(exit_code);
        }
    }
}

/// Value following `switch` in the engine's command line.
fn switch_value(arguments: &[String], switch: &str) -> Option<String> {
    arguments
        .iter()
        .position(|a| a.eq_ignore_ascii_case(switch))
        .and_then(|i| arguments.get(i + 1))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ba::{BaReply, NullBa};
    use crate::detect::SnapshotState;
    use crate::pipe::channel::test_support::channel_pair;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
        [bundle]
        id = "{B0B0}"
        name = "Empty"
        version = "1.0"
        provider_key = "empty.bundle"
    "#;

    struct Fixture {
        engine: EngineContext,
        snapshot: Arc<SystemSnapshot>,
        _cache: tempfile::TempDir,
    }

    fn context(command: BaCommand) -> Fixture {
        let cache = tempfile::tempdir().unwrap();
        let model = BundleModel::from_toml(MANIFEST).unwrap();
        let mut config = EngineConfig::default();
        config.cache.root = cache.path().join("user");
        config.cache.machine_root = cache.path().join("machine");
        let snapshot = Arc::new(SystemSnapshot::new(SnapshotState::default()));
        let services = LocalServices::from_config(&config, snapshot.clone());
        Fixture {
            engine: EngineContext::new(model, config, command, services).unwrap(),
            snapshot,
            _cache: cache,
        }
    }

    #[test]
    fn test_switch_value() {
        let args = vec!["-quiet".to_string(), "-PARENT".into(), "p.key".into()];
        assert_eq!(switch_value(&args, "-parent"), Some("p.key".to_string()));
        assert_eq!(switch_value(&args, "-layout"), None);
    }

    #[tokio::test]
    async fn test_passive_run_installs_and_quits() {
        let Fixture {
            engine,
            snapshot,
            _cache,
        } = context(BaCommand {
            action: Some(BundleAction::Install),
            passive: true,
            ..BaCommand::default()
        });
        let exit = engine.run().await.unwrap();
        assert_eq!(exit, EngineExit {
            exit_code: 0,
            restart: Restart::None,
        });
        assert!(
            snapshot
                .state()
                .bundles
                .iter()
                .any(|b| b.bundle_id == "{B0B0}")
        );
    }

    #[tokio::test]
    async fn test_apply_without_plan_is_invalid() {
        let mut engine = context(BaCommand::default());
        let engine = &mut engine.engine;
        assert_eq!(engine.apply(&NullBa).await, HResult::INVALID_STATE);
    }

    #[tokio::test]
    async fn test_detect_clears_previous_plan() {
        let mut engine = context(BaCommand::default());
        let engine = &mut engine.engine;
        assert_eq!(engine.detect(&NullBa).await, HResult::S_OK);
        assert_eq!(
            engine.plan_action(&NullBa, BundleAction::Install).await,
            HResult::S_OK
        );
        assert!(engine.plan().is_some());
        engine.detect(&NullBa).await;
        assert!(engine.plan().is_none());
    }

    #[tokio::test]
    async fn test_layout_without_directory_fails_to_plan() {
        let mut engine = context(BaCommand::default());
        let engine = &mut engine.engine;
        engine.detect(&NullBa).await;
        assert_eq!(
            engine.plan_action(&NullBa, BundleAction::Layout).await,
            HResult::E_INVALIDARG
        );
    }

    #[tokio::test]
    async fn test_loop_runs_until_quit() {
        let mut engine = context(BaCommand::default());
        let engine = &mut engine.engine;
        let api = engine.api();
        let queue = engine.queue();
        queue.enqueue(EngineAction::Detect).unwrap();
        queue.enqueue(EngineAction::Quit(42)).unwrap();
        assert_eq!(engine.run_loop(&NullBa).await, 42);
        assert!(queue.is_quitting());
        api.peer_disconnected();
        assert!(queue.is_empty());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<BaEvent>>);

    impl BootstrapperApplication for Recorder {
        fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply> {
            self.0.lock().unwrap().push(event);
            Box::pin(async { BaReply::default() })
        }
    }

    #[tokio::test]
    async fn test_second_elevation_reports_already_initialized() {
        let mut fixture = context(BaCommand::default());
        let engine = &mut fixture.engine;
        let (main, _main) = channel_pair();
        let (cache, _cache) = channel_pair();
        let (log, _log) = channel_pair();
        engine.companion = Some(ElevatedCompanion::from_channels(
            main,
            cache,
            log,
            &engine.elevation,
        ));

        let queue = engine.queue();
        queue.enqueue(EngineAction::Elevate).unwrap();
        queue.enqueue(EngineAction::Quit(0)).unwrap();
        let ba = Recorder::default();
        assert_eq!(engine.run_loop(&ba).await, 0);

        let events = ba.0.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            BaEvent::ElevateComplete { status } if status == HResult::ALREADY_INITIALIZED
        ));
        assert!(engine.is_elevated());
    }

    #[tokio::test]
    async fn test_unknown_approved_exe_reports_not_found() {
        let mut engine = context(BaCommand::default());
        let engine = &mut engine.engine;
        assert_eq!(
            engine
                .launch_approved_exe(&NullBa, "Missing", None, None)
                .await,
            HResult::NOT_FOUND
        );
        assert!(!engine.is_elevated());
    }
}
