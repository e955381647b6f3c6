//! Builds a [`Plan`] from a detected model.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::request::{
    RequestInputs, default_feature_state, default_package_request_state,
    default_related_request_state, feature_actions, msi_features_changed, package_action_states,
};
use super::{
    CacheAction, CacheSyncPoint, CleanAction, ExecuteAction, FeatureChange, Plan, PlanError,
    RegistrationAction,
};
use crate::ba::events::{BaEvent, BootstrapperApplication};
use crate::hresult::HResult;
use crate::model::{
    ActionState, BundleAction, BundleModel, DependencyAction, FeatureAction, Package,
    PackageKind, RelationType, RequestState,
};
use crate::variables::{self, SharedVariables, names};
use crate::variant::Variant;

/// What to plan for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub action: BundleAction,
    /// Why this bundle was launched; `None` when run directly.
    pub relation_type: RelationType,
    /// Provider key of a parent bundle to register as a dependent.
    pub parent: Option<String>,
    pub layout_directory: Option<PathBuf>,
}

impl PlanRequest {
    pub fn new(action: BundleAction) -> Self {
        Self {
            action,
            relation_type: RelationType::None,
            parent: None,
            layout_directory: None,
        }
    }
}

/// Build a plan. `PlanComplete` is always reported, with the failure code
/// when planning stops early.
pub async fn plan(
    model: &mut BundleModel,
    variables: &SharedVariables,
    ba: &dyn BootstrapperApplication,
    request: &PlanRequest,
) -> Result<Plan, PlanError> {
    let result = build(model, variables, ba, request).await;
    let status = match &result {
        Ok(plan) => {
            info!(
                action = ?plan.action,
                packages = plan.totals.package_count,
                execute = plan.execute.len(),
                rollback = plan.rollback.len(),
                cache = plan.cache.len(),
                "Plan complete"
            );
            HResult::S_OK
        }
        Err(e) => {
            warn!(error = %e, "Plan failed");
            e.hresult()
        }
    };
    ba.on_event(BaEvent::PlanComplete { status }).await;
    result
}

async fn build(
    model: &mut BundleModel,
    variables: &SharedVariables,
    ba: &dyn BootstrapperApplication,
    request: &PlanRequest,
) -> Result<Plan, PlanError> {
    model.reset_plan();
    {
        let mut vars = variables::lock(variables)?;
        vars.set_built_in(
            names::BUNDLE_ACTION,
            Variant::numeric(request.action.as_number()),
        )?;
        if let Some(dir) = &request.layout_directory {
            vars.set_built_in(
                names::BUNDLE_LAYOUT_DIRECTORY,
                Variant::string(&dir.to_string_lossy()),
            )?;
        }
    }

    let mut plan = Plan::new(request.action);
    plan.per_machine = model.needs_elevation();

    let begin = ba
        .on_event(BaEvent::PlanBegin {
            package_count: model.packages.len(),
        })
        .await;
    if begin.wants_cancel() {
        return Err(PlanError::UserExit);
    }

    if request.action == BundleAction::Layout {
        plan_layout(model, &mut plan, request)?;
        plan.finalize();
        return Ok(plan);
    }

    plan_related_requests(model, ba, request).await?;

    let uninstall = request.action == BundleAction::Uninstall;
    if uninstall {
        append_related(model, &mut plan, |r| {
            matches!(r, RelationType::Addon | RelationType::Patch)
        });
    }

    let order: Vec<usize> = if uninstall {
        (0..model.packages.len()).rev().collect()
    } else {
        (0..model.packages.len()).collect()
    };
    for index in order {
        plan_package(model, index, &mut plan, ba, request).await?;
    }

    if !uninstall {
        append_related(model, &mut plan, |_| true);
    }

    plan_registration(model, &mut plan, request);
    plan_clean(model, &mut plan);
    plan.finalize();
    Ok(plan)
}

async fn plan_related_requests(
    model: &mut BundleModel,
    ba: &dyn BootstrapperApplication,
    request: &PlanRequest,
) -> Result<(), PlanError> {
    let ours = model.bundle.version.clone();
    for index in 0..model.related_bundles.len() {
        let (bundle_id, default) = {
            let related = &model.related_bundles[index];
            let default = default_related_request_state(
                related.relation,
                request.relation_type,
                related.version < ours,
                request.action,
            );
            (related.bundle_id.clone(), default)
        };
        let reply = ba
            .on_event(BaEvent::PlanRelatedBundle {
                bundle_id: bundle_id.clone(),
                requested: default,
            })
            .await;
        if reply.wants_cancel() {
            return Err(PlanError::UserExit);
        }
        let requested = reply.request_state.unwrap_or(default);

        let related = &mut model.related_bundles[index];
        related.default_requested = default;
        related.requested = requested;
        (related.execute, related.rollback) = match requested {
            RequestState::Absent | RequestState::ForceAbsent => {
                let rollback = if related.cached_path.is_some() {
                    ActionState::Install
                } else {
                    ActionState::None
                };
                (ActionState::Uninstall, rollback)
            }
            RequestState::Repair => (ActionState::Repair, ActionState::None),
            _ => (ActionState::None, ActionState::None),
        };
        debug!(
            related = %bundle_id,
            ?requested,
            execute = ?related.execute,
            "Planned related bundle"
        );
    }
    Ok(())
}

/// Append actions for related bundles whose relation passes `filter` and
/// that have not been planned yet.
fn append_related(model: &BundleModel, plan: &mut Plan, filter: impl Fn(RelationType) -> bool) {
    let already: HashSet<String> = plan
        .execute
        .iter()
        .filter_map(|p| match &p.action {
            ExecuteAction::RelatedBundle { bundle_id, .. } => Some(bundle_id.clone()),
            _ => None,
        })
        .collect();

    for related in &model.related_bundles {
        if related.execute == ActionState::None
            || !filter(related.relation)
            || already.contains(&related.bundle_id)
        {
            continue;
        }
        plan.note_boundary_package();
        if related.rollback != ActionState::None {
            plan.append_rollback(ExecuteAction::RelatedBundle {
                bundle_id: related.bundle_id.clone(),
                action: related.rollback,
            });
        }
        plan.execute_checkpoint();
        plan.append_execute(ExecuteAction::RelatedBundle {
            bundle_id: related.bundle_id.clone(),
            action: related.execute,
        });
    }
}

async fn plan_package(
    model: &mut BundleModel,
    index: usize,
    plan: &mut Plan,
    ba: &dyn BootstrapperApplication,
    request: &PlanRequest,
) -> Result<(), PlanError> {
    let (package_id, default, state, cached, install_condition) = {
        let package = &model.packages[index];
        let inputs = RequestInputs::for_package(package, request.action, request.relation_type);
        (
            package.id.clone(),
            default_package_request_state(inputs),
            package.runtime.current_state,
            package.runtime.cached,
            package.runtime.install_condition,
        )
    };

    let reply = ba
        .on_event(BaEvent::PlanPackageBegin {
            package_id: package_id.clone(),
            state,
            cached,
            install_condition,
            requested: default,
        })
        .await;
    if reply.wants_cancel() {
        return Err(PlanError::UserExit);
    }
    let requested = reply.request_state.unwrap_or(default);

    plan_features(model, index, requested, ba).await?;

    let uninstall = request.action == BundleAction::Uninstall;
    let boundary_id = {
        let package = &model.packages[index];
        if uninstall {
            package.rollback_boundary_backward.clone()
        } else {
            package.rollback_boundary.clone()
        }
    };
    if let Some(id) = boundary_id
        && plan.active_boundary() != Some(id.as_str())
    {
        let boundary = model
            .boundary(&id)
            .cloned()
            .ok_or(PlanError::UnknownReference {
                what: "rollback boundary",
                id,
            })?;
        plan.begin_boundary(&boundary);
    }

    let (execute, rollback) = {
        let package = &model.packages[index];
        package_action_states(package, requested, msi_features_changed(package))
    };
    let (provider, dependency) = dependency_actions(&model.packages[index], requested, execute);

    let needs_cache = {
        let package = &model.packages[index];
        !package.runtime.cached
            && !package.payloads.is_empty()
            && (matches!(
                execute,
                ActionState::Install
                    | ActionState::Modify
                    | ActionState::Repair
                    | ActionState::Mend
                    | ActionState::MinorUpgrade
            ) || requested == RequestState::Cache
                || package.cache == crate::model::CacheType::Force)
    };
    let sync = if needs_cache {
        Some(plan_cache_package(model, index, plan)?)
    } else {
        None
    };

    {
        let package = &mut model.packages[index];
        let runtime = &mut package.runtime;
        runtime.default_requested = default;
        runtime.requested = requested;
        runtime.execute = execute;
        runtime.rollback = rollback;
        runtime.cache_planned = needs_cache;
        runtime.provider_execute = provider.0;
        runtime.provider_rollback = provider.1;
        if matches!(execute, ActionState::Install | ActionState::MinorUpgrade) {
            plan.totals.install_size += package.install_size;
        }
    }

    let package = &model.packages[index];
    let execute_actions = package_actions(package, execute, false);
    let rollback_actions = package_actions(package, rollback, true);
    let has_work = !execute_actions.is_empty()
        || provider.0 != DependencyAction::None
        || dependency.0 != DependencyAction::None;

    if has_work {
        plan.note_boundary_package();

        // Rollback list gets the undo in forward order so walking backward
        // undoes in reverse.
        let bundle_provider_key = model.bundle.provider_key.clone();
        let forward_rollbacks = ordered_steps(
            uninstall_order(execute, requested),
            rollback_actions,
            provider_action(package, provider.1),
            dependency_action(package, &bundle_provider_key, dependency.1),
        );
        for action in forward_rollbacks {
            plan.append_rollback(action);
        }

        plan.execute_checkpoint();

        if let Some(sync) = &sync
            && !execute_actions.is_empty()
        {
            plan.append_execute(ExecuteAction::WaitForCache { sync: sync.clone() });
        }
        let forward = ordered_steps(
            uninstall_order(execute, requested),
            execute_actions,
            provider_action(package, provider.0),
            dependency_action(package, &bundle_provider_key, dependency.0),
        );
        for action in forward {
            plan.append_execute(action);
        }
    }

    debug!(
        package = %package_id,
        ?default,
        ?requested,
        ?execute,
        ?rollback,
        cache = needs_cache,
        "Planned package"
    );
    ba.on_event(BaEvent::PlanPackageComplete {
        package_id,
        status: HResult::S_OK,
        requested,
        execute,
        rollback,
    })
    .await;
    Ok(())
}

/// Removing a package unregisters dependencies first; installing registers
/// them after the package.
fn uninstall_order(execute: ActionState, requested: RequestState) -> bool {
    execute == ActionState::Uninstall
        || matches!(requested, RequestState::Absent | RequestState::ForceAbsent)
}

fn ordered_steps(
    uninstalling: bool,
    package: Vec<ExecuteAction>,
    provider: Option<ExecuteAction>,
    dependency: Option<ExecuteAction>,
) -> Vec<ExecuteAction> {
    let mut steps = Vec::with_capacity(package.len() + 2);
    if uninstalling {
        steps.extend(dependency);
        steps.extend(provider);
        steps.extend(package);
    } else {
        steps.extend(package);
        steps.extend(provider);
        steps.extend(dependency);
    }
    steps
}

type DependencyPair = (DependencyAction, DependencyAction);

/// Provider and dependency registration for a package.
fn dependency_actions(
    package: &Package,
    requested: RequestState,
    execute: ActionState,
) -> (DependencyPair, DependencyPair) {
    const NONE: DependencyPair = (DependencyAction::None, DependencyAction::None);
    if package.providers.is_empty() {
        return (NONE, NONE);
    }
    let authored_provider = package.providers.iter().any(|p| !p.imported);
    match requested {
        RequestState::Present | RequestState::Repair | RequestState::Mend => {
            let provider = if execute == ActionState::Install && authored_provider {
                (DependencyAction::Register, DependencyAction::Unregister)
            } else {
                NONE
            };
            (
                provider,
                (DependencyAction::Register, DependencyAction::Unregister),
            )
        }
        RequestState::Absent | RequestState::ForceAbsent => {
            let provider = if execute == ActionState::Uninstall && authored_provider {
                (DependencyAction::Unregister, DependencyAction::Register)
            } else {
                NONE
            };
            (
                provider,
                (DependencyAction::Unregister, DependencyAction::Register),
            )
        }
        RequestState::Cache | RequestState::None => (NONE, NONE),
    }
}

fn provider_action(package: &Package, action: DependencyAction) -> Option<ExecuteAction> {
    (action != DependencyAction::None).then(|| ExecuteAction::PackageProvider {
        package_id: package.id.clone(),
        action,
    })
}

fn dependency_action(
    package: &Package,
    bundle_provider_key: &str,
    action: DependencyAction,
) -> Option<ExecuteAction> {
    (action != DependencyAction::None).then(|| ExecuteAction::PackageDependency {
        package_id: package.id.clone(),
        bundle_provider_key: bundle_provider_key.to_string(),
        action,
    })
}

/// The execute (or rollback) actions that run `action` against a package.
fn package_actions(package: &Package, action: ActionState, rollback: bool) -> Vec<ExecuteAction> {
    if action == ActionState::None {
        return Vec::new();
    }
    let package_id = package.id.clone();
    match &package.kind {
        PackageKind::Exe(_) => vec![ExecuteAction::ExePackage { package_id, action }],
        PackageKind::Msu(_) => vec![ExecuteAction::MsuPackage { package_id, action }],
        PackageKind::Bundle(_) => vec![ExecuteAction::BundlePackage { package_id, action }],
        PackageKind::Msp(msp) => msp
            .target_product_codes
            .iter()
            .map(|code| ExecuteAction::MspTarget {
                package_id: package_id.clone(),
                target_product_code: code.clone(),
                action,
            })
            .collect(),
        PackageKind::Msi(msi) => {
            let features = msi
                .features
                .iter()
                .filter_map(|f| {
                    let change = if rollback { f.rollback } else { f.execute };
                    (change != FeatureAction::None).then(|| FeatureChange {
                        feature_id: f.id.clone(),
                        action: change,
                    })
                })
                .collect();
            vec![ExecuteAction::MsiPackage {
                package_id,
                action,
                features,
                slipstream: msi.slipstream_patches.clone(),
            }]
        }
    }
}

async fn plan_features(
    model: &mut BundleModel,
    index: usize,
    requested: RequestState,
    ba: &dyn BootstrapperApplication,
) -> Result<(), PlanError> {
    let (package_id, package_current, features) = {
        let package = &model.packages[index];
        let PackageKind::Msi(msi) = &package.kind else {
            return Ok(());
        };
        let features: Vec<_> = msi
            .features
            .iter()
            .map(|f| (f.id.clone(), f.current, f.default_state))
            .collect();
        (package.id.clone(), package.runtime.current_state, features)
    };

    for (i, (feature_id, current, authored)) in features.into_iter().enumerate() {
        let default = default_feature_state(current, authored, requested, package_current);
        let reply = ba
            .on_event(BaEvent::PlanMsiFeature {
                package_id: package_id.clone(),
                feature_id,
                requested: default,
            })
            .await;
        if reply.wants_cancel() {
            return Err(PlanError::UserExit);
        }
        let feature_requested = reply.feature_state.unwrap_or(default);
        let (execute, rollback) =
            feature_actions(current, feature_requested, requested == RequestState::Repair);

        if let PackageKind::Msi(msi) = &mut model.packages[index].kind
            && let Some(feature) = msi.features.get_mut(i)
        {
            feature.requested = feature_requested;
            feature.execute = execute;
            feature.rollback = rollback;
        }
    }
    Ok(())
}

/// Plan the cache actions for one package and return its sync point.
fn plan_cache_package(
    model: &BundleModel,
    index: usize,
    plan: &mut Plan,
) -> Result<CacheSyncPoint, PlanError> {
    let package = &model.packages[index];
    plan.append_rollback_cache(CacheAction::RollbackPackage {
        package_id: package.id.clone(),
    });
    plan.cache_checkpoint();

    let start = plan.append_cache(CacheAction::PackageStart {
        package_id: package.id.clone(),
        payload_count: 0,
        size: 0,
    });
    let mut count = 0;
    let mut size = 0;
    for key in &package.payloads {
        let payload = model.payload(key).ok_or_else(|| PlanError::UnknownReference {
            what: "payload",
            id: key.clone(),
        })?;
        if payload.layout_only {
            continue;
        }
        acquire_payload(model, plan, payload)?;
        plan.append_cache(CacheAction::CachePayload {
            package_id: package.id.clone(),
            payload_key: key.clone(),
        });
        count += 1;
        size += payload.size;
    }
    if let CacheAction::PackageStart {
        payload_count,
        size: total,
        ..
    } = &mut plan.cache[start].action
    {
        *payload_count = count;
        *total = size;
    }
    plan.append_cache(CacheAction::PackageStop {
        package_id: package.id.clone(),
    });
    let sync = CacheSyncPoint::new(&package.id);
    plan.append_cache(CacheAction::SignalSyncPoint { sync: sync.clone() });

    plan.totals.cache_package_count += 1;
    plan.totals.cache_size += size;
    Ok(sync)
}

/// Get a payload's bytes local: extract from its container or acquire it.
fn acquire_payload(
    model: &BundleModel,
    plan: &mut Plan,
    payload: &crate::model::Payload,
) -> Result<(), PlanError> {
    match &payload.container {
        Some(container_id) => {
            let container =
                model
                    .container(container_id)
                    .ok_or_else(|| PlanError::UnknownReference {
                        what: "container",
                        id: container_id.clone(),
                    })?;
            let fresh = !plan.has_extract(container_id);
            if fresh && !container.attached {
                plan.append_cache(CacheAction::AcquireContainer {
                    container_id: container_id.clone(),
                });
            }
            plan.extract_payload(container_id, &payload.key);
        }
        None => {
            plan.append_cache(CacheAction::AcquirePayload {
                payload_key: payload.key.clone(),
            });
        }
    }
    Ok(())
}

fn plan_layout(
    model: &mut BundleModel,
    plan: &mut Plan,
    request: &PlanRequest,
) -> Result<(), PlanError> {
    let directory = request
        .layout_directory
        .clone()
        .ok_or(PlanError::MissingLayoutDirectory)?;
    plan.layout_directory = Some(directory.clone());
    plan.append_cache(CacheAction::LayoutBundle {
        layout_directory: directory.clone(),
    });

    let mut laid_out = HashSet::new();
    for package in &mut model.packages {
        package.runtime.requested = RequestState::Cache;
        package.runtime.cache_planned = true;
    }
    for package in &model.packages {
        plan.cache_checkpoint();
        plan.append_cache(CacheAction::PackageStart {
            package_id: package.id.clone(),
            payload_count: package.payloads.len(),
            size: package
                .payloads
                .iter()
                .filter_map(|k| model.payload(k))
                .map(|p| p.size)
                .sum(),
        });
        for key in &package.payloads {
            let payload = model.payload(key).ok_or_else(|| PlanError::UnknownReference {
                what: "payload",
                id: key.clone(),
            })?;
            acquire_payload(model, plan, payload)?;
            plan.append_cache(CacheAction::LayoutPayload {
                payload_key: key.clone(),
                layout_directory: directory.clone(),
            });
            plan.totals.cache_size += payload.size;
            laid_out.insert(key.clone());
        }
        plan.append_cache(CacheAction::PackageStop {
            package_id: package.id.clone(),
        });
        plan.totals.cache_package_count += 1;
    }

    for payload in &model.payloads {
        if payload.ux || laid_out.contains(&payload.key) {
            continue;
        }
        acquire_payload(model, plan, payload)?;
        plan.append_cache(CacheAction::LayoutPayload {
            payload_key: payload.key.clone(),
            layout_directory: directory.clone(),
        });
        plan.totals.cache_size += payload.size;
    }
    Ok(())
}

fn plan_registration(model: &BundleModel, plan: &mut Plan, request: &PlanRequest) {
    match request.action {
        BundleAction::Install
        | BundleAction::Modify
        | BundleAction::Repair
        | BundleAction::UpdateReplace
        | BundleAction::UpdateReplaceEmbedded => {
            plan.registration.push(RegistrationAction::RegisterBundle);
            if !model.installed {
                plan.rollback_registration
                    .push(RegistrationAction::UnregisterBundle);
            }
            if let Some(parent) = &request.parent {
                plan.registration.push(RegistrationAction::RegisterDependent {
                    dependent: parent.clone(),
                });
                plan.rollback_registration
                    .push(RegistrationAction::UnregisterDependent {
                        dependent: parent.clone(),
                    });
            }
        }
        BundleAction::Uninstall => {
            if let Some(parent) = &request.parent {
                plan.registration
                    .push(RegistrationAction::UnregisterDependent {
                        dependent: parent.clone(),
                    });
            }
            if model.installed {
                plan.registration.push(RegistrationAction::UnregisterBundle);
            }
        }
        _ => {}
    }
}

fn plan_clean(model: &BundleModel, plan: &mut Plan) {
    for package in &model.packages {
        let runtime = &package.runtime;
        let has_cache = runtime.cached || runtime.cache_planned;
        let uncache = if package.cache == crate::model::CacheType::Force {
            false
        } else if runtime.execute == ActionState::Uninstall {
            has_cache
        } else if plan.action == BundleAction::Uninstall
            && matches!(
                runtime.requested,
                RequestState::Absent | RequestState::ForceAbsent
            )
            && !package.permanent
        {
            runtime.cached && !runtime.other_dependents
        } else {
            package.cache == crate::model::CacheType::Remove
                && has_cache
                && matches!(
                    runtime.execute,
                    ActionState::Install
                        | ActionState::Modify
                        | ActionState::Repair
                        | ActionState::Mend
                )
        };
        if uncache {
            plan.clean.push(CleanAction::UncachePackage {
                package_id: package.id.clone(),
            });
        }
        if let Some(compatible) = &runtime.compatible
            && matches!(
                runtime.requested,
                RequestState::Absent | RequestState::ForceAbsent
            )
        {
            plan.clean.push(CleanAction::RemoveCompatible {
                package_id: package.id.clone(),
                product_code: compatible.product_code.clone(),
            });
        }
    }
}
