//! Apply engine.
//!
//! Runs a [`Plan`]: registration, then the cache and execute phases side
//! by side, then either unregistration and clean-up or rollback. The cache
//! phase releases each package to the execute phase through its
//! [`CacheSyncPoint`](crate::plan::CacheSyncPoint).

pub mod approved_exe;
pub mod cache;
pub mod executor;
pub mod registration;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use approved_exe::{ApprovedExeError, LaunchCommand};
pub use cache::{CacheError, CacheProvider, FileCache};
pub use executor::{
    CommandLineExecutor, ExecuteReporter, OperationKind, PackageExecutor, PackageOperation,
    SilentReporter,
};
pub use registration::{BundleRegistration, Registrar, RegistrationOp};

use crate::BoxFuture;
use crate::ba::events::{
    AllowedResults, BaEvent, BootstrapperApplication, ErrorType, UiResult,
};
use crate::hresult::HResult;
use crate::model::{ActionState, BundleModel, Restart};
use crate::plan::{CacheAction, CacheStatus, CleanAction, ExecuteAction, Plan};
use crate::variables::{self, SharedVariables, VariableError};

/// Attempts at acquiring one container or payload when the application
/// keeps answering `Retry`.
const MAX_ACQUIRE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("unknown package '{0}'")]
    UnknownPackage(String),

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    ApprovedExe(#[from] ApprovedExeError),

    #[error("cancelled by the application")]
    UserExit,
}

impl ApplyError {
    pub fn hresult(&self) -> HResult {
        match self {
            ApplyError::UnknownPackage(_) => HResult::NOT_FOUND,
            ApplyError::Variable(_) => HResult::E_INVALIDARG,
            ApplyError::Cache(e) => e.hresult(),
            ApplyError::ApprovedExe(e) => e.hresult(),
            ApplyError::UserExit => HResult::INSTALL_USEREXIT,
        }
    }
}

/// Everything an apply talks to.
#[derive(Clone, Copy)]
pub struct ApplyContext<'a> {
    pub model: &'a BundleModel,
    pub variables: &'a SharedVariables,
    pub ba: &'a dyn BootstrapperApplication,
    pub executor: &'a dyn PackageExecutor,
    pub cache: &'a dyn CacheProvider,
    pub registrar: &'a dyn Registrar,
}

/// Outcome of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplyResult {
    pub status: HResult,
    pub restart: Restart,
    /// Whether any rollback ran.
    pub rolled_back: bool,
}

/// State shared by the cache and execute phases.
struct ApplyState {
    error: Mutex<Option<HResult>>,
    restart: Mutex<Restart>,
    rolled_back: AtomicBool,
    /// Packages whose forward execution stands; their cache survives a
    /// cache rollback.
    kept: Mutex<HashSet<String>>,
    cache_checkpoint: Mutex<Option<u32>>,
    ticks: AtomicUsize,
    total_ticks: usize,
}

impl ApplyState {
    fn new(total_ticks: usize) -> Self {
        Self {
            error: Mutex::new(None),
            restart: Mutex::new(Restart::None),
            rolled_back: AtomicBool::new(false),
            kept: Mutex::new(HashSet::new()),
            cache_checkpoint: Mutex::new(None),
            ticks: AtomicUsize::new(0),
            total_ticks,
        }
    }

    /// Record a failure. The first one wins.
    fn fail(&self, hr: HResult) {
        let mut error = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if error.is_none() {
            *error = Some(hr);
        }
    }

    fn error(&self) -> Option<HResult> {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failed(&self) -> bool {
        self.error().is_some()
    }

    fn merge_restart(&self, restart: Restart) {
        let mut current = self.restart.lock().unwrap_or_else(PoisonError::into_inner);
        *current = current.merge(restart);
    }

    fn restart(&self) -> Restart {
        *self.restart.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn keep(&self, package_id: &str, kept: bool) {
        let mut set = self.kept.lock().unwrap_or_else(PoisonError::into_inner);
        if kept {
            set.insert(package_id.to_string());
        } else {
            set.remove(package_id);
        }
    }

    fn is_kept(&self, package_id: &str) -> bool {
        self.kept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(package_id)
    }

    fn set_cache_checkpoint(&self, id: Option<u32>) {
        *self
            .cache_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }

    fn cache_checkpoint(&self) -> Option<u32> {
        *self
            .cache_checkpoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn tick(&self) -> u32 {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.overall()
    }

    fn overall(&self) -> u32 {
        if self.total_ticks == 0 {
            return 100;
        }
        let done = self.ticks.load(Ordering::SeqCst).min(self.total_ticks);
        u32::try_from(done * 100 / self.total_ticks).unwrap_or(100)
    }
}

/// Apply `plan`. Never fails outright: failures are reported through the
/// returned status after rollback.
pub async fn apply(ctx: &ApplyContext<'_>, plan: &Plan) -> ApplyResult {
    let state = ApplyState::new(plan.totals.overall_ticks());
    plan.reset_sync_points();

    let has_cache = plan.cache.iter().any(|p| !p.deleted);
    let has_execute = plan.live_execute().any(ExecuteAction::is_package);
    let phase_count = u32::from(has_cache) + u32::from(has_execute);
    info!(action = ?plan.action, phase_count, "Apply begin");

    let begin = ctx.ba.on_event(BaEvent::ApplyBegin { phase_count }).await;
    if begin.wants_cancel() {
        state.fail(HResult::INSTALL_USEREXIT);
    } else {
        register(ctx, plan, &state).await;
        if !state.failed() {
            tokio::join!(
                cache_phase(ctx, plan, &state),
                execute_phase(ctx, plan, &state)
            );
        }

        if state.failed() {
            rollback_cache(ctx, plan, &state).await;
            rollback_registration(ctx, plan).await;
        } else {
            unregister(ctx, plan, &state).await;
            clean(ctx, plan).await;
        }
    }

    let status = state.error().unwrap_or(HResult::S_OK);
    let mut restart = state.restart();
    let reply = ctx
        .ba
        .on_event(BaEvent::ApplyComplete { status, restart })
        .await;
    if reply.restart && restart >= Restart::Required {
        info!("Application asked to restart now");
        restart = Restart::Initiated;
    }

    let result = ApplyResult {
        status,
        restart,
        rolled_back: state.rolled_back.load(Ordering::SeqCst),
    };
    info!(status = %result.status, restart = ?result.restart, rolled_back = result.rolled_back, "Apply complete");
    result
}

fn persisted_variables(ctx: &ApplyContext<'_>) -> BTreeMap<String, String> {
    match variables::lock(ctx.variables).and_then(|mut v| v.persisted_values()) {
        Ok(values) => values,
        Err(e) => {
            warn!(error = %e, "Failed to collect persisted variables");
            BTreeMap::new()
        }
    }
}

async fn register(ctx: &ApplyContext<'_>, plan: &Plan, state: &ApplyState) {
    let begin = ctx.ba.on_event(BaEvent::RegisterBegin).await;
    let mut status = HResult::S_OK;
    if begin.wants_cancel() {
        status = HResult::INSTALL_USEREXIT;
    } else {
        for action in plan.registration.iter().filter(|a| a.is_register()) {
            let op = RegistrationOp::for_bundle(ctx.model, action, || persisted_variables(ctx));
            if let Err(hr) = ctx.registrar.apply(&op).await {
                warn!(?action, error = %hr, "Registration failed");
                status = hr;
                break;
            }
        }
    }
    if status.is_failure() {
        state.fail(status);
    }
    ctx.ba.on_event(BaEvent::RegisterComplete { status }).await;
}

async fn unregister(ctx: &ApplyContext<'_>, plan: &Plan, state: &ApplyState) {
    let unregisters: Vec<_> = plan
        .registration
        .iter()
        .filter(|a| !a.is_register())
        .collect();
    if unregisters.is_empty() {
        return;
    }
    ctx.ba.on_event(BaEvent::UnregisterBegin).await;
    let mut status = HResult::S_OK;
    for action in unregisters {
        let op = RegistrationOp::for_bundle(ctx.model, action, BTreeMap::new);
        if let Err(hr) = ctx.registrar.apply(&op).await {
            warn!(?action, error = %hr, "Unregistration failed");
            status = hr;
        }
    }
    if status.is_failure() {
        state.fail(status);
    }
    ctx.ba.on_event(BaEvent::UnregisterComplete { status }).await;
}

async fn rollback_registration(ctx: &ApplyContext<'_>, plan: &Plan) {
    for action in &plan.rollback_registration {
        let op = RegistrationOp::for_bundle(ctx.model, action, BTreeMap::new);
        if let Err(hr) = ctx.registrar.apply(&op).await {
            warn!(?action, error = %hr, "Registration rollback failed, continuing");
        }
    }
}

/// Clean-up after a successful apply. Failures are logged only.
async fn clean(ctx: &ApplyContext<'_>, plan: &Plan) {
    for action in &plan.clean {
        match action {
            CleanAction::UncachePackage { package_id } => {
                if let Err(e) = ctx.cache.remove_package(package_id).await {
                    warn!(package_id, error = %e, "Failed to remove cached package");
                }
            }
            CleanAction::RemoveCompatible {
                package_id,
                product_code,
            } => {
                let per_machine = ctx.model.package(package_id).is_some_and(|p| p.per_machine);
                let operation =
                    PackageOperation::remove_compatible(package_id, product_code, per_machine);
                let mut reporter = SilentReporter;
                match ctx.executor.execute(&operation, &mut reporter).await {
                    Ok(_) => info!(package_id, product_code, "Removed compatible package"),
                    Err(hr) => {
                        warn!(package_id, product_code, error = %hr, "Failed to remove compatible package")
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Cache phase
// ---------------------------------------------------------------------------

async fn cache_phase(ctx: &ApplyContext<'_>, plan: &Plan, state: &ApplyState) {
    if plan.cache.iter().all(|p| p.deleted) {
        return;
    }

    let begin = ctx.ba.on_event(BaEvent::CacheBegin).await;
    if begin.wants_cancel() {
        state.fail(HResult::INSTALL_USEREXIT);
    }

    let mut checkpoint = None;
    for action in plan.cache.iter().filter_map(|p| p.live()) {
        if state.failed() {
            break;
        }
        if let Err(hr) = cache_action(ctx, state, action, &mut checkpoint).await {
            warn!(error = %hr, "Cache phase failed");
            state.fail(hr);
        }
    }
    state.set_cache_checkpoint(checkpoint);

    // Release any package still waiting. Already signalled points keep
    // their first status.
    let released = state.error().unwrap_or(HResult::E_ABORT);
    for planned in &plan.cache {
        if let CacheAction::SignalSyncPoint { sync } = &planned.action {
            sync.signal(CacheStatus::Failed(released));
        }
    }

    let status = state.error().unwrap_or(HResult::S_OK);
    ctx.ba.on_event(BaEvent::CacheComplete { status }).await;
}

async fn cache_action(
    ctx: &ApplyContext<'_>,
    state: &ApplyState,
    action: &CacheAction,
    checkpoint: &mut Option<u32>,
) -> Result<(), HResult> {
    let model = ctx.model;
    let cache = ctx.cache;
    match action {
        CacheAction::Checkpoint { id } => *checkpoint = Some(*id),
        CacheAction::LayoutBundle { layout_directory } => {
            cache
                .layout_bundle(layout_directory)
                .await
                .map_err(|e| e.hresult())?;
        }
        CacheAction::PackageStart {
            package_id,
            payload_count,
            size,
        } => {
            let reply = ctx
                .ba
                .on_event(BaEvent::CachePackageBegin {
                    package_id: package_id.clone(),
                    payload_count: *payload_count,
                    size: *size,
                })
                .await;
            if reply.wants_cancel() {
                return Err(HResult::INSTALL_USEREXIT);
            }
        }
        CacheAction::AcquireContainer { container_id } => {
            let container = model.container(container_id).ok_or(HResult::NOT_FOUND)?;
            let source = container
                .download
                .as_ref()
                .map(|d| d.url.clone())
                .or_else(|| container.file_path.as_ref().map(|p| p.display().to_string()));
            acquire(ctx, container_id, source, || {
                cache.acquire_container(container, &model.source_directory)
            })
            .await?;
        }
        CacheAction::ExtractContainer {
            container_id,
            payload_keys,
        } => {
            let container = model.container(container_id).ok_or(HResult::NOT_FOUND)?;
            let payloads: Vec<_> = payload_keys
                .iter()
                .map(|k| model.payload(k).ok_or(HResult::NOT_FOUND))
                .collect::<Result<_, _>>()?;
            debug!(container_id, count = payloads.len(), "Extracting container");
            cache
                .extract_container(container, &model.source_directory, &payloads)
                .await
                .map_err(|e| e.hresult())?;
        }
        CacheAction::AcquirePayload { payload_key } => {
            let payload = model.payload(payload_key).ok_or(HResult::NOT_FOUND)?;
            let source = payload
                .download
                .as_ref()
                .map(|d| d.url.clone())
                .or_else(|| Some(payload.file_path.display().to_string()));
            acquire(ctx, payload_key, source, || {
                cache.acquire_payload(payload, &model.source_directory)
            })
            .await?;
        }
        CacheAction::CachePayload {
            package_id,
            payload_key,
        } => {
            let payload = model.payload(payload_key).ok_or(HResult::NOT_FOUND)?;
            let result = cache.cache_payload(package_id, payload).await;
            let status = result.as_ref().err().map_or(HResult::S_OK, CacheError::hresult);
            ctx.ba
                .on_event(BaEvent::CacheVerifyComplete {
                    package_id: package_id.clone(),
                    payload_key: payload_key.clone(),
                    status,
                })
                .await;
            result.map_err(|e| {
                warn!(package_id, payload_key, error = %e, "Payload verification failed");
                e.hresult()
            })?;
        }
        CacheAction::LayoutPayload {
            payload_key,
            layout_directory,
        } => {
            let payload = model.payload(payload_key).ok_or(HResult::NOT_FOUND)?;
            cache
                .layout_payload(payload, layout_directory)
                .await
                .map_err(|e| e.hresult())?;
        }
        CacheAction::PackageStop { package_id } => {
            ctx.ba
                .on_event(BaEvent::CachePackageComplete {
                    package_id: package_id.clone(),
                    status: HResult::S_OK,
                })
                .await;
            let overall = state.tick();
            let reply = ctx
                .ba
                .on_event(BaEvent::Progress {
                    progress_percentage: 100,
                    overall_percentage: overall,
                })
                .await;
            if reply.wants_cancel() {
                return Err(HResult::INSTALL_USEREXIT);
            }
        }
        CacheAction::SignalSyncPoint { sync } => {
            debug!(package_id = sync.package_id(), "Package cached");
            sync.signal(CacheStatus::Complete);
        }
        CacheAction::RollbackPackage { .. } => {}
    }
    Ok(())
}

/// Acquire one item, letting the application retry failures.
async fn acquire<'a, F>(
    ctx: &ApplyContext<'a>,
    id: &str,
    source: Option<String>,
    mut attempt: F,
) -> Result<(), HResult>
where
    F: FnMut() -> BoxFuture<'a, Result<(), CacheError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let begin = ctx
            .ba
            .on_event(BaEvent::CacheAcquireBegin {
                id: id.to_string(),
                source: source.clone(),
            })
            .await;
        if begin.wants_cancel() {
            return Err(HResult::INSTALL_USEREXIT);
        }

        let result = attempt().await;
        let status = result.as_ref().err().map_or(HResult::S_OK, CacheError::hresult);
        let reply = ctx
            .ba
            .on_event(BaEvent::CacheAcquireComplete {
                id: id.to_string(),
                status,
            })
            .await;
        let Err(e) = result else {
            return Ok(());
        };
        warn!(id, attempt = attempts, error = %e, "Acquire failed");
        if reply.result.filter(AllowedResults::RetryCancel) == UiResult::Retry
            && attempts < MAX_ACQUIRE_ATTEMPTS
        {
            info!(id, "Application asked to retry acquire");
            continue;
        }
        return Err(e.hresult());
    }
}

/// Remove what this apply cached for packages that did not stay installed.
async fn rollback_cache(ctx: &ApplyContext<'_>, plan: &Plan, state: &ApplyState) {
    let Some(id) = state.cache_checkpoint() else {
        return;
    };
    let Some(start) = plan.rollback_cache_checkpoint_index(id) else {
        warn!(checkpoint = id, "Cache rollback checkpoint missing");
        return;
    };
    for action in plan.rollback_cache[..=start].iter().rev().filter_map(|p| p.live()) {
        if let CacheAction::RollbackPackage { package_id } = action {
            if state.is_kept(package_id) {
                continue;
            }
            debug!(package_id, "Rolling back cached package");
            if let Err(e) = ctx.cache.remove_package(package_id).await {
                warn!(package_id, error = %e, "Cache rollback failed, continuing");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execute phase
// ---------------------------------------------------------------------------

struct Boundary {
    id: String,
    vital: bool,
    in_transaction: bool,
}

async fn execute_phase(ctx: &ApplyContext<'_>, plan: &Plan, state: &ApplyState) {
    let begin = ctx
        .ba
        .on_event(BaEvent::ExecuteBegin {
            package_count: plan.totals.package_count,
        })
        .await;
    if begin.wants_cancel() {
        state.fail(HResult::INSTALL_USEREXIT);
    }

    let mut checkpoint: Option<u32> = None;
    let mut boundary: Option<Boundary> = None;
    let mut index = 0;
    while index < plan.execute.len() {
        let planned = &plan.execute[index];
        index += 1;
        let Some(action) = planned.live() else {
            continue;
        };

        // An error raised elsewhere (cache, cancel) is not ours to forgive.
        let step = match state.error() {
            Some(hr) => Err((hr, false)),
            None => execute_action(ctx, state, action, &mut checkpoint, &mut boundary)
                .await
                .map_err(|hr| (hr, true)),
        };
        let Err((hr, own)) = step else {
            continue;
        };
        let forgiven = own && boundary.as_ref().is_some_and(|b| !b.vital);
        if !forgiven {
            state.fail(hr);
        }
        warn!(error = %hr, "Execute failed, rolling back");

        let mut transaction_rolled_back = false;
        if let Some(b) = boundary.as_mut()
            && b.in_transaction
        {
            b.in_transaction = false;
            match ctx.executor.rollback_transaction(&b.id).await {
                Ok(()) => transaction_rolled_back = true,
                Err(e) => warn!(boundary = %b.id, error = %e, "Transaction rollback failed"),
            }
        }
        rollback(ctx, plan, state, checkpoint, transaction_rolled_back).await;
        state.rolled_back.store(true, Ordering::SeqCst);

        match boundary.take() {
            Some(b) if forgiven => {
                info!(boundary = %b.id, "Non-vital boundary rolled back, continuing");
                checkpoint = None;
                while index < plan.execute.len() {
                    let end = matches!(
                        plan.execute[index].live(),
                        Some(ExecuteAction::RollbackBoundaryEnd { boundary_id }) if *boundary_id == b.id
                    );
                    index += 1;
                    if end {
                        break;
                    }
                }
            }
            _ => break,
        }
    }

    let status = state.error().unwrap_or(HResult::S_OK);
    ctx.ba.on_event(BaEvent::ExecuteComplete { status }).await;
}

async fn execute_action(
    ctx: &ApplyContext<'_>,
    state: &ApplyState,
    action: &ExecuteAction,
    checkpoint: &mut Option<u32>,
    boundary: &mut Option<Boundary>,
) -> Result<(), HResult> {
    match action {
        ExecuteAction::Checkpoint { id, .. } => *checkpoint = Some(*id),
        ExecuteAction::RollbackBoundaryStart {
            boundary_id, vital, ..
        } => {
            *boundary = Some(Boundary {
                id: boundary_id.clone(),
                vital: *vital,
                in_transaction: false,
            });
            *checkpoint = None;
        }
        ExecuteAction::RollbackBoundaryEnd { .. } => *boundary = None,
        ExecuteAction::BeginMsiTransaction { boundary_id } => {
            if ctx.executor.supports_transactions() {
                ctx.executor.begin_transaction(boundary_id).await?;
                if let Some(b) = boundary.as_mut() {
                    b.in_transaction = true;
                }
            }
        }
        ExecuteAction::CommitMsiTransaction { boundary_id } => {
            if let Some(b) = boundary.as_mut()
                && b.in_transaction
            {
                let restart = ctx.executor.commit_transaction(boundary_id).await?;
                b.in_transaction = false;
                state.merge_restart(restart);
            }
        }
        ExecuteAction::WaitForCache { sync } => match sync.wait().await {
            CacheStatus::Complete => {}
            CacheStatus::Failed(hr) => return Err(hr),
            CacheStatus::Pending => return Err(HResult::E_ABORT),
        },
        ExecuteAction::PackageProvider { package_id, .. }
        | ExecuteAction::PackageDependency { package_id, .. } => {
            dependency_action(ctx, package_id, action).await?;
        }
        _ if action.is_package() => run_package(ctx, state, action, false).await?,
        _ => {}
    }
    Ok(())
}

async fn dependency_action(
    ctx: &ApplyContext<'_>,
    package_id: &str,
    action: &ExecuteAction,
) -> Result<(), HResult> {
    let package = ctx.model.package(package_id).ok_or(HResult::NOT_FOUND)?;
    for op in RegistrationOp::for_package(package, action) {
        ctx.registrar.apply(&op).await.inspect_err(|hr| {
            warn!(package_id, ?op, error = %hr, "Dependency registration failed");
        })?;
    }
    Ok(())
}

/// Walk the rollback list backward from `checkpoint` to the enclosing
/// boundary. Failures are logged and rollback continues.
async fn rollback(
    ctx: &ApplyContext<'_>,
    plan: &Plan,
    state: &ApplyState,
    checkpoint: Option<u32>,
    skip_windows_installer: bool,
) {
    let Some(id) = checkpoint else {
        debug!("Nothing to roll back in this boundary");
        return;
    };
    let Some(start) = plan.rollback_checkpoint_index(id) else {
        warn!(checkpoint = id, "Rollback checkpoint missing");
        return;
    };
    for action in plan.rollback[..=start].iter().rev().filter_map(|p| p.live()) {
        match action {
            ExecuteAction::RollbackBoundaryStart { .. } => break,
            ExecuteAction::MsiPackage { package_id, .. }
            | ExecuteAction::MspTarget { package_id, .. }
                if skip_windows_installer =>
            {
                debug!(package_id, "Undone by transaction rollback");
                state.keep(package_id, false);
            }
            ExecuteAction::PackageProvider { package_id, .. }
            | ExecuteAction::PackageDependency { package_id, .. } => {
                if let Err(hr) = dependency_action(ctx, package_id, action).await {
                    warn!(package_id, error = %hr, "Dependency rollback failed, continuing");
                }
            }
            _ if action.is_package() => {
                if let Err(hr) = run_package(ctx, state, action, true).await {
                    warn!(package_id = ?action.package_id(), error = %hr, "Package rollback failed, continuing");
                }
            }
            _ => {}
        }
    }
}

/// Reports package progress and errors to the application.
struct BaReporter<'r> {
    ba: &'r dyn BootstrapperApplication,
    state: &'r ApplyState,
    package_id: &'r str,
    error_type: ErrorType,
    rollback: bool,
}

impl BaReporter<'_> {
    fn filter(&self, result: UiResult, allowed: AllowedResults) -> UiResult {
        if self.rollback {
            result.filter_rollback(allowed)
        } else {
            result.filter(allowed)
        }
    }
}

impl ExecuteReporter for BaReporter<'_> {
    fn progress(&mut self, percentage: u32) -> BoxFuture<'_, UiResult> {
        Box::pin(async move {
            let reply = self
                .ba
                .on_event(BaEvent::ExecuteProgress {
                    package_id: self.package_id.to_string(),
                    progress_percentage: percentage,
                    overall_percentage: self.state.overall(),
                })
                .await;
            let raw = if reply.cancel {
                UiResult::Cancel
            } else {
                reply.result
            };
            self.filter(raw, AllowedResults::OkCancel)
        })
    }

    fn error<'a>(
        &'a mut self,
        code: HResult,
        message: &'a str,
        allowed: AllowedResults,
    ) -> BoxFuture<'a, UiResult> {
        Box::pin(async move {
            let reply = self
                .ba
                .on_event(BaEvent::Error {
                    error_type: self.error_type,
                    package_id: Some(self.package_id.to_string()),
                    code,
                    message: message.to_string(),
                    allowed,
                    data: Vec::new(),
                })
                .await;
            self.filter(reply.result, allowed)
        })
    }
}

/// Run one package action, honouring the application's retry and ignore
/// answers.
async fn run_package(
    ctx: &ApplyContext<'_>,
    state: &ApplyState,
    action: &ExecuteAction,
    rollback: bool,
) -> Result<(), HResult> {
    let package_id = action.package_id().unwrap_or_default();
    let operation = {
        let mut vars = variables::lock(ctx.variables).map_err(|e| {
            warn!(error = %e, "Variables unavailable");
            HResult::E_FAIL
        })?;
        PackageOperation::for_action(
            ctx.model,
            &mut vars,
            &|id| ctx.cache.package_directory(id),
            action,
            rollback,
        )
    }
    .map_err(|e| {
        warn!(package_id, error = %e, "Failed to prepare package");
        e.hresult()
    })?;
    let Some(operation) = operation else {
        return Ok(());
    };
    // Related bundles are not in the model and are always vital.
    let vital = ctx.model.package(package_id).is_none_or(|p| p.vital);

    let begin = ctx
        .ba
        .on_event(BaEvent::ExecutePackageBegin {
            package_id: package_id.to_string(),
            execute: !rollback,
            action: action.action_state().unwrap_or(ActionState::None),
        })
        .await;
    if begin.wants_cancel() && !rollback {
        return Err(HResult::INSTALL_USEREXIT);
    }

    let error_type = if operation.is_windows_installer() {
        ErrorType::WindowsInstaller
    } else {
        ErrorType::ExePackage
    };
    loop {
        info!(package_id, action = ?operation.action, rollback, arguments = %operation.log_arguments, "Executing package");
        let mut reporter = BaReporter {
            ba: ctx.ba,
            state,
            package_id,
            error_type,
            rollback,
        };
        let result = ctx.executor.execute(&operation, &mut reporter).await;
        let (status, restart) = match result {
            Ok(restart) => (HResult::S_OK, restart),
            Err(hr) => (hr, Restart::None),
        };
        let reply = ctx
            .ba
            .on_event(BaEvent::ExecutePackageComplete {
                package_id: package_id.to_string(),
                status,
                restart,
            })
            .await;

        if status.is_success() {
            state.merge_restart(restart);
            state.keep(package_id, !rollback);
            if !rollback {
                let overall = state.tick();
                ctx.ba
                    .on_event(BaEvent::Progress {
                        progress_percentage: 100,
                        overall_percentage: overall,
                    })
                    .await;
            }
            return Ok(());
        }

        let choice = if rollback {
            reply.result.filter_rollback(AllowedResults::AbortRetryIgnore)
        } else {
            reply.result.filter(AllowedResults::AbortRetryIgnore)
        };
        match choice {
            UiResult::Retry => {
                info!(package_id, "Application asked to retry package");
                continue;
            }
            UiResult::Ignore if !rollback => {
                warn!(package_id, error = %status, "Package failure ignored by application");
                return Ok(());
            }
            _ if !vital && !rollback => {
                warn!(package_id, error = %status, "Non-vital package failed, continuing");
                return Ok(());
            }
            _ => return Err(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use super::*;
    use crate::ba::events::BaReply;
    use crate::model::{BundleAction, Container, PackageState, Payload};
    use crate::plan::{PlanRequest, plan};
    use crate::variables::Variables;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
        [bundle]
        id = "{B0B0}"
        name = "Sample"
        version = "2.0.0"
        provider_key = "sample.bundle"

        [[payloads]]
        key = "app.msi"
        file_path = "app.msi"
        size = 10

        [[payloads]]
        key = "redist.exe"
        file_path = "redist.exe"
        packaging = "external"
        size = 20
        verification = { method = "hash", sha256 = "00" }

        [[payloads]]
        key = "tools.exe"
        file_path = "tools.exe"
        size = 5

        [[rollback_boundaries]]
        id = "rb1"

        [[rollback_boundaries]]
        id = "optional"
        vital = false

        [[packages]]
        id = "Redist"
        type = "exe"
        install_arguments = "/quiet"
        uninstall_arguments = "/uninstall"
        payloads = ["redist.exe"]

        [[packages]]
        id = "App"
        type = "msi"
        product_code = "{AAAA}"
        version = "2.0.0"
        rollback_boundary = "rb1"
        payloads = ["app.msi"]
        providers = [{ key = "app.provider" }]

        [[packages]]
        id = "Tools"
        type = "exe"
        install_arguments = "/quiet"
        uninstall_arguments = "/uninstall"
        rollback_boundary = "optional"
        payloads = ["tools.exe"]
    "#;

    type Responder = Box<dyn Fn(&BaEvent) -> BaReply + Send + Sync>;

    struct Recorder {
        events: Mutex<Vec<BaEvent>>,
        respond: Responder,
    }

    impl Recorder {
        fn new(respond: impl Fn(&BaEvent) -> BaReply + Send + Sync + 'static) -> Self {
            Self {
                events: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            }
        }

        fn defaults() -> Self {
            Self::new(|_| BaReply::default())
        }

        fn last(&self) -> BaEvent {
            self.events.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self, name: &str) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.name() == name)
                .count()
        }
    }

    impl BootstrapperApplication for Recorder {
        fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply> {
            let reply = (self.respond)(&event);
            self.events.lock().unwrap().push(event);
            Box::pin(async move { reply })
        }
    }

    /// Succeeds unless told to fail a package; failures repeat `failures` times.
    #[derive(Default)]
    struct FakeExecutor {
        runs: Mutex<Vec<(String, bool)>>,
        fail: Option<(String, HResult)>,
        failures: Mutex<u32>,
        restart: Restart,
    }

    impl FakeExecutor {
        fn failing(package_id: &str, hr: HResult, failures: u32) -> Self {
            Self {
                fail: Some((package_id.to_string(), hr)),
                failures: Mutex::new(failures),
                ..Self::default()
            }
        }

        fn runs(&self) -> Vec<(String, bool)> {
            self.runs.lock().unwrap().clone()
        }
    }

    impl PackageExecutor for FakeExecutor {
        fn execute<'a>(
            &'a self,
            operation: &'a PackageOperation,
            reporter: &'a mut dyn ExecuteReporter,
        ) -> BoxFuture<'a, Result<Restart, HResult>> {
            Box::pin(async move {
                reporter.progress(50).await;
                self.runs
                    .lock()
                    .unwrap()
                    .push((operation.package_id.clone(), operation.rollback));
                if let Some((id, hr)) = &self.fail
                    && *id == operation.package_id
                    && !operation.rollback
                {
                    let mut left = self.failures.lock().unwrap();
                    if *left > 0 {
                        *left -= 1;
                        return Err(*hr);
                    }
                }
                Ok(self.restart)
            })
        }
    }

    #[derive(Default)]
    struct FakeCache {
        fail_payload: Option<String>,
        cached: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl CacheProvider for FakeCache {
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
            source_directory: &'a Path,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async move {
                if self.fail_payload.as_deref() == Some(payload.key.as_str()) {
                    return Err(CacheError::MissingSource {
                        key: payload.key.clone(),
                        path: source_directory.join(&payload.file_path),
                    });
                }
                Ok(())
            })
        }

        fn cache_payload<'a>(
            &'a self,
            package_id: &'a str,
            _payload: &'a Payload,
        ) -> BoxFuture<'a, Result<(), CacheError>> {
            Box::pin(async move {
                self.cached.lock().unwrap().push(package_id.to_string());
                Ok(())
            })
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
                self.removed.lock().unwrap().push(package_id.to_string());
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct FakeRegistrar {
        ops: Mutex<Vec<RegistrationOp>>,
    }

    impl Registrar for FakeRegistrar {
        fn apply<'a>(&'a self, op: &'a RegistrationOp) -> BoxFuture<'a, Result<(), HResult>> {
            Box::pin(async move {
                self.ops.lock().unwrap().push(op.clone());
                Ok(())
            })
        }
    }

    fn fresh_model() -> BundleModel {
        let mut model = BundleModel::from_toml(MANIFEST).unwrap();
        for package in &mut model.packages {
            package.runtime.current_state = PackageState::Absent;
            package.runtime.install_condition = true;
        }
        model
    }

    struct Harness {
        model: BundleModel,
        variables: SharedVariables,
        ba: Recorder,
        executor: FakeExecutor,
        cache: FakeCache,
        registrar: FakeRegistrar,
    }

    impl Harness {
        fn new(ba: Recorder, executor: FakeExecutor, cache: FakeCache) -> Self {
            Self {
                model: fresh_model(),
                variables: variables::shared(Variables::new()),
                ba,
                executor,
                cache,
                registrar: FakeRegistrar::default(),
            }
        }

        async fn run(&mut self, action: BundleAction) -> ApplyResult {
            let null = crate::ba::events::NullBa;
            let plan = plan(
                &mut self.model,
                &self.variables,
                &null,
                &PlanRequest::new(action),
            )
            .await
            .unwrap();
            let ctx = ApplyContext {
                model: &self.model,
                variables: &self.variables,
                ba: &self.ba,
                executor: &self.executor,
                cache: &self.cache,
                registrar: &self.registrar,
            };
            apply(&ctx, &plan).await
        }

        fn ops(&self) -> Vec<RegistrationOp> {
            self.registrar.ops.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_fresh_install_succeeds() {
        let mut h = Harness::new(
            Recorder::defaults(),
            FakeExecutor::default(),
            FakeCache::default(),
        );
        let result = h.run(BundleAction::Install).await;

        assert_eq!(
            result,
            ApplyResult {
                status: HResult::S_OK,
                restart: Restart::None,
                rolled_back: false,
            }
        );
        assert_eq!(
            h.executor.runs(),
            vec![
                ("Redist".to_string(), false),
                ("App".to_string(), false),
                ("Tools".to_string(), false),
            ]
        );
        let ops = h.ops();
        assert!(matches!(ops[0], RegistrationOp::RegisterBundle(_)));
        assert!(ops.iter().any(|op| matches!(
            op,
            RegistrationOp::RegisterProvider { provider_key, .. } if provider_key == "app.provider"
        )));
        assert!(h.cache.removed.lock().unwrap().is_empty());
        assert!(matches!(
            h.ba.last(),
            BaEvent::ApplyComplete { status, .. } if status == HResult::S_OK
        ));
    }

    #[tokio::test]
    async fn test_vital_failure_rolls_back_boundary() {
        let mut h = Harness::new(
            Recorder::defaults(),
            FakeExecutor::failing("App", HResult::INSTALL_FAILURE, u32::MAX),
            FakeCache::default(),
        );
        let result = h.run(BundleAction::Install).await;

        assert_eq!(result.status, HResult::INSTALL_FAILURE);
        assert!(result.rolled_back);
        let runs = h.executor.runs();
        // App is undone; Redist sits before the boundary and stays; Tools never runs.
        assert!(runs.contains(&("App".to_string(), true)));
        assert!(!runs.contains(&("Redist".to_string(), true)));
        assert!(!runs.iter().any(|(id, _)| id == "Tools"));

        let ops = h.ops();
        assert!(ops.contains(&RegistrationOp::UnregisterBundle {
            bundle_id: "{B0B0}".into()
        }));
        let removed = h.cache.removed.lock().unwrap().clone();
        assert!(removed.contains(&"App".to_string()));
        assert!(!removed.contains(&"Redist".to_string()));
    }

    #[tokio::test]
    async fn test_non_vital_boundary_failure_continues() {
        let mut h = Harness::new(
            Recorder::defaults(),
            FakeExecutor::failing("Tools", HResult::INSTALL_FAILURE, u32::MAX),
            FakeCache::default(),
        );
        let result = h.run(BundleAction::Install).await;

        assert_eq!(result.status, HResult::S_OK);
        assert!(result.rolled_back);
        assert!(h.executor.runs().contains(&("Tools".to_string(), true)));
        assert!(!h.ops().contains(&RegistrationOp::UnregisterBundle {
            bundle_id: "{B0B0}".into()
        }));
    }

    #[tokio::test]
    async fn test_retry_reruns_package() {
        let ba = Recorder::new(|event| match event {
            BaEvent::ExecutePackageComplete { status, .. } if status.is_failure() => {
                BaReply::result(UiResult::Retry)
            }
            _ => BaReply::default(),
        });
        let mut h = Harness::new(
            ba,
            FakeExecutor::failing("Redist", HResult::E_FAIL, 1),
            FakeCache::default(),
        );
        let result = h.run(BundleAction::Install).await;

        assert_eq!(result.status, HResult::S_OK);
        let redist_runs = h
            .executor
            .runs()
            .iter()
            .filter(|(id, _)| id == "Redist")
            .count();
        assert_eq!(redist_runs, 2);
    }

    #[tokio::test]
    async fn test_cache_failure_stops_execute() {
        let cache = FakeCache {
            fail_payload: Some("redist.exe".into()),
            ..FakeCache::default()
        };
        let mut h = Harness::new(Recorder::defaults(), FakeExecutor::default(), cache);
        let result = h.run(BundleAction::Install).await;

        assert_eq!(result.status, HResult::NOT_FOUND);
        assert!(h.executor.runs().is_empty());
        assert_eq!(h.ba.count("cache_acquire_complete"), 1);
    }

    #[tokio::test]
    async fn test_cancel_at_begin() {
        let ba = Recorder::new(|event| match event {
            BaEvent::ApplyBegin { .. } => BaReply::cancel(),
            _ => BaReply::default(),
        });
        let mut h = Harness::new(ba, FakeExecutor::default(), FakeCache::default());
        let result = h.run(BundleAction::Install).await;

        assert_eq!(result.status, HResult::INSTALL_USEREXIT);
        assert!(h.executor.runs().is_empty());
        assert!(h.ops().is_empty());
    }

    #[tokio::test]
    async fn test_restart_now() {
        let ba = Recorder::new(|event| match event {
            BaEvent::ApplyComplete { .. } => BaReply {
                restart: true,
                ..BaReply::default()
            },
            _ => BaReply::default(),
        });
        let executor = FakeExecutor {
            restart: Restart::Required,
            ..FakeExecutor::default()
        };
        let mut h = Harness::new(ba, executor, FakeCache::default());
        let result = h.run(BundleAction::Install).await;

        assert_eq!(result.restart, Restart::Initiated);
    }
}
