//! Detect pass and registration probes.
//!
//! Detect resets every package's runtime state, then asks a
//! [`RegistrationProbe`] what is installed, cached and registered on the
//! machine, writing the answers into the model and reporting each fact to
//! the application.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::apply::registration::{Registrar, RegistrationOp};
use crate::ba::events::{BaEvent, BootstrapperApplication};
use crate::condition::{self, ConditionError};
use crate::hresult::HResult;
use crate::model::{
    BundleAction, BundleModel, CompatiblePackage, FeatureState, PackageKind, PackageState,
    RelatedBundle, RelatedCodes, RelatedOperation, RelationType, RequestState, UpdateEntry,
};
use crate::variables::{self, SharedVariables, VariableError, names};
use crate::variant::Variant;
use crate::version::Version;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("condition for '{id}': {source}")]
    Condition {
        id: String,
        #[source]
        source: ConditionError,
    },

    #[error(transparent)]
    Variable(#[from] VariableError),

    #[error("detect cancelled by the application")]
    UserExit,

    #[error("failed to read snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid snapshot: {0}")]
    Format(String),
}

impl DetectError {
    pub fn hresult(&self) -> HResult {
        match self {
            DetectError::Condition { .. } => HResult::INVALID_DATA,
            DetectError::Variable(_) => HResult::E_INVALIDARG,
            DetectError::UserExit => HResult::INSTALL_USEREXIT,
            DetectError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                HResult::NOT_FOUND
            }
            DetectError::Io { .. } => HResult::E_FAIL,
            DetectError::Format(_) => HResult::INVALID_DATA,
        }
    }
}

/// A bundle registered on the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledBundle {
    pub bundle_id: String,
    pub version: Version,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub per_machine: bool,
    #[serde(default)]
    pub provider_key: Option<String>,
    #[serde(default)]
    pub upgrade_codes: Vec<String>,
    #[serde(default)]
    pub addon_codes: Vec<String>,
    #[serde(default)]
    pub patch_codes: Vec<String>,
    #[serde(default)]
    pub detect_codes: Vec<String>,
    #[serde(default)]
    pub cached_path: Option<PathBuf>,
    /// Persisted variables saved at registration.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// An installed Windows Installer product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledProduct {
    pub product_code: String,
    pub version: Version,
    #[serde(default)]
    pub upgrade_code: Option<String>,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureState>,
    #[serde(default)]
    pub patches: BTreeSet<String>,
}

/// A registered dependency provider and who depends on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Product that registered the provider, when it was an MSI.
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub dependents: BTreeSet<String>,
}

/// Read access to machine registration state.
pub trait RegistrationProbe: Send + Sync {
    fn installed_bundles(&self) -> Vec<InstalledBundle>;

    fn product(&self, product_code: &str) -> Option<InstalledProduct>;

    fn products_with_upgrade_code(&self, upgrade_code: &str) -> Vec<InstalledProduct>;

    fn msu_installed(&self, kb: &str) -> bool;

    fn is_cached(&self, package_id: &str) -> bool;

    fn provider(&self, provider_key: &str) -> Option<ProviderRecord>;

    /// Entries published on an update feed.
    fn update_entries(&self, source: &str) -> Vec<UpdateEntry>;
}

/// Serializable machine state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotState {
    pub bundles: Vec<InstalledBundle>,
    pub products: Vec<InstalledProduct>,
    pub msus: BTreeSet<String>,
    pub cached: BTreeSet<String>,
    pub providers: BTreeMap<String, ProviderRecord>,
    pub updates: Vec<UpdateEntry>,
}

impl SnapshotState {
    fn apply(&mut self, op: &RegistrationOp) {
        match op {
            RegistrationOp::RegisterBundle(reg) => {
                self.bundles.retain(|b| b.bundle_id != reg.bundle_id);
                self.bundles.push(InstalledBundle {
                    bundle_id: reg.bundle_id.clone(),
                    version: reg.version.clone(),
                    tag: reg.tag.clone(),
                    per_machine: reg.per_machine,
                    provider_key: Some(reg.provider_key.clone()),
                    upgrade_codes: reg.upgrade_codes.clone(),
                    addon_codes: Vec::new(),
                    patch_codes: Vec::new(),
                    detect_codes: Vec::new(),
                    cached_path: None,
                    variables: reg.variables.clone(),
                });
                self.providers
                    .entry(reg.provider_key.clone())
                    .or_default()
                    .version = Some(reg.version.to_string());
            }
            RegistrationOp::UnregisterBundle { bundle_id } => {
                let provider = self
                    .bundles
                    .iter()
                    .find(|b| b.bundle_id == *bundle_id)
                    .and_then(|b| b.provider_key.clone());
                self.bundles.retain(|b| b.bundle_id != *bundle_id);
                if let Some(key) = provider
                    && self.providers.get(&key).is_some_and(|p| p.dependents.is_empty())
                {
                    self.providers.remove(&key);
                }
            }
            RegistrationOp::RegisterDependent {
                provider_key,
                dependent,
            } => {
                self.providers
                    .entry(provider_key.clone())
                    .or_default()
                    .dependents
                    .insert(dependent.clone());
            }
            RegistrationOp::UnregisterDependent {
                provider_key,
                dependent,
            } => {
                if let Some(record) = self.providers.get_mut(provider_key) {
                    record.dependents.remove(dependent);
                }
            }
            RegistrationOp::RegisterProvider {
                provider_key,
                version,
                display_name,
                ..
            } => {
                let record = self.providers.entry(provider_key.clone()).or_default();
                record.version.clone_from(version);
                record.display_name.clone_from(display_name);
            }
            RegistrationOp::UnregisterProvider { provider_key, .. } => {
                if self
                    .providers
                    .get(provider_key)
                    .is_some_and(|p| p.dependents.is_empty())
                {
                    self.providers.remove(provider_key);
                } else {
                    warn!(provider_key, "Provider still has dependents, keeping it");
                }
            }
        }
    }
}

/// In-memory registration state, optionally backed by a file that is
/// rewritten after every registration change.
#[derive(Debug, Default)]
pub struct SystemSnapshot {
    state: Mutex<SnapshotState>,
    path: Option<PathBuf>,
}

impl SystemSnapshot {
    pub fn new(state: SnapshotState) -> Self {
        Self {
            state: Mutex::new(state),
            path: None,
        }
    }

    /// Parse TOML or, for a `.json` path, JSON.
    pub fn parse(text: &str, json: bool) -> Result<SnapshotState, DetectError> {
        if json {
            serde_json::from_str(text).map_err(|e| DetectError::Format(e.to_string()))
        } else {
            toml::from_str(text).map_err(|e| DetectError::Format(e.to_string()))
        }
    }

    /// Load from `path`, starting empty when it does not exist. Changes are
    /// saved back to it.
    pub async fn open(path: &Path) -> Result<Self, DetectError> {
        let state = match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::parse(&text, is_json(path))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SnapshotState::default(),
            Err(source) => {
                return Err(DetectError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        debug!(path = %path.display(), bundles = state.bundles.len(), "Loaded snapshot");
        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn state(&self) -> SnapshotState {
        self.lock().clone()
    }

    pub fn mark_cached(&self, package_id: &str) {
        self.lock().cached.insert(package_id.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapshotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn save(&self, state: SnapshotState) -> Result<(), HResult> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let text = if is_json(path) {
            serde_json::to_string_pretty(&state).map_err(|_| HResult::E_FAIL)?
        } else {
            toml::to_string_pretty(&state).map_err(|_| HResult::E_FAIL)?
        };
        tokio::fs::write(path, text).await.map_err(|e| {
            warn!(path = %path.display(), error = %e, "Failed to save snapshot");
            HResult::E_FAIL
        })
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

impl RegistrationProbe for SystemSnapshot {
    fn installed_bundles(&self) -> Vec<InstalledBundle> {
        self.lock().bundles.clone()
    }

    fn product(&self, product_code: &str) -> Option<InstalledProduct> {
        self.lock()
            .products
            .iter()
            .find(|p| p.product_code.eq_ignore_ascii_case(product_code))
            .cloned()
    }

    fn products_with_upgrade_code(&self, upgrade_code: &str) -> Vec<InstalledProduct> {
        self.lock()
            .products
            .iter()
            .filter(|p| {
                p.upgrade_code
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(upgrade_code))
            })
            .cloned()
            .collect()
    }

    fn msu_installed(&self, kb: &str) -> bool {
        self.lock().msus.contains(kb)
    }

    fn is_cached(&self, package_id: &str) -> bool {
        self.lock().cached.contains(package_id)
    }

    fn provider(&self, provider_key: &str) -> Option<ProviderRecord> {
        self.lock().providers.get(provider_key).cloned()
    }

    fn update_entries(&self, source: &str) -> Vec<UpdateEntry> {
        self.lock()
            .updates
            .iter()
            .filter(|u| u.source == source)
            .cloned()
            .collect()
    }
}

impl Registrar for SystemSnapshot {
    fn apply<'a>(&'a self, op: &'a RegistrationOp) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            let state = {
                let mut state = self.lock();
                state.apply(op);
                state.clone()
            };
            self.save(state).await
        })
    }
}

fn intersects(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| b.iter().any(|y| x.eq_ignore_ascii_case(y)))
}

/// How an installed bundle relates to this one.
pub fn relation_type(ours: &RelatedCodes, theirs: &InstalledBundle) -> RelationType {
    if intersects(&ours.detect, &theirs.upgrade_codes) {
        RelationType::Detect
    } else if intersects(&ours.upgrade, &theirs.upgrade_codes) {
        RelationType::Upgrade
    } else if intersects(&ours.upgrade, &theirs.addon_codes) {
        RelationType::Addon
    } else if intersects(&ours.upgrade, &theirs.patch_codes) {
        RelationType::Patch
    } else if intersects(&ours.addon, &theirs.upgrade_codes)
        || intersects(&ours.patch, &theirs.upgrade_codes)
    {
        RelationType::Dependent
    } else {
        RelationType::None
    }
}

/// What running this bundle would do to a related bundle.
pub fn related_operation(
    relation: RelationType,
    ours: &Version,
    theirs: &Version,
    action: BundleAction,
) -> RelatedOperation {
    match relation {
        RelationType::Upgrade => {
            if action == BundleAction::Uninstall {
                RelatedOperation::None
            } else if theirs < ours {
                RelatedOperation::MajorUpgrade
            } else if theirs > ours {
                RelatedOperation::Downgrade
            } else {
                RelatedOperation::None
            }
        }
        RelationType::Addon | RelationType::Patch => match action {
            BundleAction::Uninstall => RelatedOperation::Remove,
            BundleAction::Install | BundleAction::Modify => RelatedOperation::Install,
            BundleAction::Repair => RelatedOperation::Repair,
            _ => RelatedOperation::None,
        },
        _ => RelatedOperation::None,
    }
}

/// Run the detect pass. Always reports `DetectComplete`.
pub async fn detect(
    model: &mut BundleModel,
    variables: &SharedVariables,
    ba: &dyn BootstrapperApplication,
    probe: &dyn RegistrationProbe,
    action: BundleAction,
) -> Result<(), DetectError> {
    let result = run(model, variables, ba, probe, action).await;
    let status = match &result {
        Ok(()) => HResult::S_OK,
        Err(e) => {
            warn!(error = %e, "Detect failed");
            e.hresult()
        }
    };
    ba.on_event(BaEvent::DetectComplete { status }).await;
    result
}

async fn run(
    model: &mut BundleModel,
    variables: &SharedVariables,
    ba: &dyn BootstrapperApplication,
    probe: &dyn RegistrationProbe,
    action: BundleAction,
) -> Result<(), DetectError> {
    model.reset_detect();
    let bundles = probe.installed_bundles();
    model.installed = bundles.iter().any(|b| b.bundle_id == model.bundle.id);
    variables::lock(variables)?.set_built_in(
        names::BUNDLE_INSTALLED,
        Variant::numeric(i64::from(model.installed)),
    )?;
    info!(bundle = %model.bundle.id, installed = model.installed, "Detect begin");

    let begin = ba
        .on_event(BaEvent::DetectBegin {
            installed: model.installed,
            package_count: model.packages.len(),
        })
        .await;
    if begin.wants_cancel() {
        return Err(DetectError::UserExit);
    }

    detect_update(model, ba, probe).await?;
    detect_related_bundles(model, ba, &bundles, action).await?;
    for index in 0..model.packages.len() {
        detect_package(model, index, variables, ba, probe).await?;
    }
    Ok(())
}

async fn detect_update(
    model: &mut BundleModel,
    ba: &dyn BootstrapperApplication,
    probe: &dyn RegistrationProbe,
) -> Result<(), DetectError> {
    let Some(source) = model.update.source.clone() else {
        return Ok(());
    };
    let begin = ba
        .on_event(BaEvent::DetectUpdateBegin {
            source: source.clone(),
        })
        .await;
    if !begin.wants_cancel() {
        for entry in probe.update_entries(&source) {
            if entry.version <= model.bundle.version {
                continue;
            }
            let reply = ba
                .on_event(BaEvent::DetectUpdate {
                    source: entry.source.clone(),
                    version: entry.version.to_string(),
                    size: entry.size,
                    title: entry.title.clone(),
                })
                .await;
            debug!(version = %entry.version, "Update available");
            model.updates.push(entry);
            if reply.wants_cancel() {
                break;
            }
        }
    }
    ba.on_event(BaEvent::DetectUpdateComplete {
        status: HResult::S_OK,
    })
    .await;
    Ok(())
}

async fn detect_related_bundles(
    model: &mut BundleModel,
    ba: &dyn BootstrapperApplication,
    bundles: &[InstalledBundle],
    action: BundleAction,
) -> Result<(), DetectError> {
    for installed in bundles.iter().filter(|b| b.bundle_id != model.bundle.id) {
        let relation = relation_type(&model.bundle.related, installed);
        if relation == RelationType::None {
            continue;
        }
        let operation =
            related_operation(relation, &model.bundle.version, &installed.version, action);
        info!(bundle_id = %installed.bundle_id, ?relation, ?operation, "Detected related bundle");
        let reply = ba
            .on_event(BaEvent::DetectRelatedBundle {
                bundle_id: installed.bundle_id.clone(),
                relation,
                version: installed.version.to_string(),
                per_machine: installed.per_machine,
                operation,
            })
            .await;
        if reply.wants_cancel() {
            return Err(DetectError::UserExit);
        }
        model.related_bundles.push(RelatedBundle {
            bundle_id: installed.bundle_id.clone(),
            relation,
            version: installed.version.clone(),
            per_machine: installed.per_machine,
            tag: installed.tag.clone(),
            provider_key: installed.provider_key.clone(),
            cached_path: installed.cached_path.clone(),
            operation,
            default_requested: RequestState::None,
            requested: RequestState::None,
            execute: Default::default(),
            rollback: Default::default(),
        });
    }
    Ok(())
}

/// Facts gathered for one package before any callback is sent.
struct PackageFacts {
    state: PackageState,
    features: Vec<(String, FeatureState)>,
    compatible: Option<CompatiblePackage>,
}

fn probe_package(
    model: &BundleModel,
    index: usize,
    variables: &SharedVariables,
    probe: &dyn RegistrationProbe,
    bundles: &[InstalledBundle],
) -> Result<PackageFacts, DetectError> {
    let package = &model.packages[index];
    let condition_error = |source| DetectError::Condition {
        id: package.id.clone(),
        source,
    };
    let mut facts = PackageFacts {
        state: PackageState::Absent,
        features: Vec::new(),
        compatible: None,
    };

    match &package.kind {
        PackageKind::Exe(exe) => {
            let mut vars = variables::lock(variables)?;
            // Without a detect condition an exe is never found installed.
            let present = match exe.detect_condition.as_deref() {
                Some(c) if !c.trim().is_empty() => {
                    condition::evaluate(c, &mut vars).map_err(condition_error)?
                }
                _ => false,
            };
            facts.state = if present {
                PackageState::Present
            } else {
                PackageState::Absent
            };
        }
        PackageKind::Msu(msu) => {
            let present = match msu.detect_condition.as_deref() {
                Some(c) if !c.trim().is_empty() => {
                    let mut vars = variables::lock(variables)?;
                    condition::evaluate(c, &mut vars).map_err(condition_error)?
                }
                _ => probe.msu_installed(&msu.kb),
            };
            facts.state = if present {
                PackageState::Present
            } else {
                PackageState::Absent
            };
        }
        PackageKind::Msi(msi) => {
            let installed = probe.product(&msi.product_code);
            facts.state = match &installed {
                Some(_) => PackageState::Present,
                None => {
                    let newer = msi.upgrade_code.as_deref().is_some_and(|code| {
                        probe
                            .products_with_upgrade_code(code)
                            .iter()
                            .any(|p| p.version > msi.version)
                    });
                    if newer {
                        PackageState::Obsolete
                    } else {
                        PackageState::Absent
                    }
                }
            };
            facts.features = msi
                .features
                .iter()
                .map(|f| {
                    let state = installed
                        .as_ref()
                        .map_or(FeatureState::Absent, |p| {
                            p.features.get(&f.id).copied().unwrap_or(FeatureState::Absent)
                        });
                    (f.id.clone(), state)
                })
                .collect();
            if installed.is_none() {
                facts.compatible = package.providers.iter().find_map(|provider| {
                    let record = probe.provider(&provider.key)?;
                    let code = record.product_code?;
                    if code.eq_ignore_ascii_case(&msi.product_code) {
                        return None;
                    }
                    let product = probe.product(&code)?;
                    Some(CompatiblePackage {
                        product_code: product.product_code,
                        version: product.version,
                    })
                });
            }
        }
        PackageKind::Msp(msp) => {
            let applied = msp.target_product_codes.iter().any(|code| {
                probe
                    .product(code)
                    .is_some_and(|p| p.patches.contains(&msp.patch_code))
            });
            facts.state = if applied {
                PackageState::Present
            } else {
                PackageState::Absent
            };
        }
        PackageKind::Bundle(nested) => {
            facts.state = match bundles.iter().find(|b| b.bundle_id == nested.bundle_id) {
                Some(b) if b.version > nested.version => PackageState::Obsolete,
                Some(_) => PackageState::Present,
                None => PackageState::Absent,
            };
        }
    }
    Ok(facts)
}

async fn detect_package(
    model: &mut BundleModel,
    index: usize,
    variables: &SharedVariables,
    ba: &dyn BootstrapperApplication,
    probe: &dyn RegistrationProbe,
) -> Result<(), DetectError> {
    let package_id = model.packages[index].id.clone();
    let begin = ba
        .on_event(BaEvent::DetectPackageBegin {
            package_id: package_id.clone(),
        })
        .await;
    if begin.wants_cancel() {
        return Err(DetectError::UserExit);
    }

    let bundles = probe.installed_bundles();
    let facts = probe_package(model, index, variables, probe, &bundles)?;
    let install_condition = {
        let package = &model.packages[index];
        let mut vars = variables::lock(variables)?;
        condition::evaluate_optional(package.install_condition.as_deref(), &mut vars).map_err(
            |source| DetectError::Condition {
                id: package_id.clone(),
                source,
            },
        )?
    };
    let cached = probe.is_cached(&package_id);
    let bundle_provider = model.bundle.provider_key.clone();
    let other_dependents = model.packages[index].providers.iter().any(|p| {
        probe
            .provider(&p.key)
            .is_some_and(|r| r.dependents.iter().any(|d| *d != bundle_provider))
    });

    let mut state = facts.state;
    if state == PackageState::Absent && cached {
        state = PackageState::Cached;
    }

    if let Some(compatible) = &facts.compatible {
        let reply = ba
            .on_event(BaEvent::DetectCompatiblePackage {
                package_id: package_id.clone(),
                product_code: compatible.product_code.clone(),
                version: compatible.version.to_string(),
            })
            .await;
        if reply.wants_cancel() {
            return Err(DetectError::UserExit);
        }
    }
    for (feature_id, feature_state) in &facts.features {
        let reply = ba
            .on_event(BaEvent::DetectMsiFeature {
                package_id: package_id.clone(),
                feature_id: feature_id.clone(),
                state: *feature_state,
            })
            .await;
        if reply.wants_cancel() {
            return Err(DetectError::UserExit);
        }
    }

    let package = &mut model.packages[index];
    package.runtime.current_state = state;
    package.runtime.cached = cached;
    package.runtime.install_condition = install_condition;
    package.runtime.other_dependents = other_dependents;
    package.runtime.compatible = facts.compatible;
    if let PackageKind::Msi(msi) = &mut package.kind {
        for (feature, (_, current)) in msi.features.iter_mut().zip(&facts.features) {
            feature.current = *current;
        }
    }
    debug!(package_id, ?state, cached, install_condition, "Detected package");

    ba.on_event(BaEvent::DetectPackageComplete {
        package_id,
        status: HResult::S_OK,
        state,
        cached,
    })
    .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ba::events::{BaReply, NullBa};
    use crate::variables::Variables;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
        [bundle]
        id = "{B0B0}"
        name = "Sample"
        version = "2.0.0"
        provider_key = "sample.bundle"
        related = { upgrade = ["{UP}"] }

        [[packages]]
        id = "Tool"
        type = "exe"
        detect_condition = "ToolVersion >= v1.0"
        install_condition = "NOT SkipTool"

        [[packages]]
        id = "App"
        type = "msi"
        product_code = "{AAAA}"
        version = "2.0.0"
        upgrade_code = "{APPUP}"
        features = [{ id = "Main" }, { id = "Docs" }]
        providers = [{ key = "app.provider" }]

        [[packages]]
        id = "Hotfix"
        type = "msu"
        kb = "KB123"
    "#;

    const SNAPSHOT: &str = r#"
        cached = ["App"]
        msus = ["KB123"]

        [[bundles]]
        bundle_id = "{OLD}"
        version = "1.0.0"
        upgrade_codes = ["{UP}"]

        [[bundles]]
        bundle_id = "{ADDON}"
        version = "1.0.0"
        addon_codes = ["{UP}"]

        [[products]]
        product_code = "{OLDAPP}"
        version = "1.5.0"
        upgrade_code = "{APPUP}"
        features = { Main = "local" }

        [providers."app.provider"]
        product_code = "{OLDAPP}"
        dependents = ["sample.bundle", "other.bundle"]
    "#;

    struct Recorder(Mutex<Vec<BaEvent>>);

    impl BootstrapperApplication for Recorder {
        fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply> {
            self.0.lock().unwrap().push(event);
            Box::pin(async { BaReply::default() })
        }
    }

    fn snapshot() -> SystemSnapshot {
        SystemSnapshot::new(SystemSnapshot::parse(SNAPSHOT, false).unwrap())
    }

    fn vars() -> SharedVariables {
        let mut vars = Variables::new();
        vars.set_version("ToolVersion", Version::parse("1.2"))
            .unwrap();
        variables::shared(vars)
    }

    #[tokio::test]
    async fn test_detect_fills_runtime_state() {
        let mut model = BundleModel::from_toml(MANIFEST).unwrap();
        let ba = Recorder(Mutex::new(Vec::new()));
        let vars = vars();
        detect(&mut model, &vars, &ba, &snapshot(), BundleAction::Install)
            .await
            .unwrap();

        let tool = model.package("Tool").unwrap();
        assert_eq!(tool.runtime.current_state, PackageState::Present);
        assert!(tool.runtime.install_condition);

        let app = model.package("App").unwrap();
        assert_eq!(app.runtime.current_state, PackageState::Cached);
        assert!(app.runtime.cached);
        assert!(app.runtime.other_dependents);
        assert_eq!(
            app.runtime.compatible.as_ref().map(|c| c.product_code.as_str()),
            Some("{OLDAPP}")
        );

        let hotfix = model.package("Hotfix").unwrap();
        assert_eq!(hotfix.runtime.current_state, PackageState::Present);

        assert!(!model.installed);
        assert_eq!(
            variables::lock(&vars)
                .unwrap()
                .get_numeric(names::BUNDLE_INSTALLED)
                .unwrap(),
            0
        );

        let events = ba.0.lock().unwrap();
        assert!(matches!(events.first(), Some(BaEvent::DetectBegin { .. })));
        assert!(matches!(
            events.last(),
            Some(BaEvent::DetectComplete { status }) if *status == HResult::S_OK
        ));
        let features = events
            .iter()
            .filter(|e| matches!(e, BaEvent::DetectMsiFeature { .. }))
            .count();
        assert_eq!(features, 2);
    }

    #[tokio::test]
    async fn test_related_bundles_are_classified() {
        let mut model = BundleModel::from_toml(MANIFEST).unwrap();
        detect(&mut model, &vars(), &NullBa, &snapshot(), BundleAction::Install)
            .await
            .unwrap();
        let related: Vec<_> = model
            .related_bundles
            .iter()
            .map(|r| (r.bundle_id.as_str(), r.relation, r.operation))
            .collect();
        assert_eq!(
            related,
            vec![
                ("{OLD}", RelationType::Upgrade, RelatedOperation::MajorUpgrade),
                ("{ADDON}", RelationType::Addon, RelatedOperation::Install),
            ]
        );
    }

    #[test]
    fn test_related_operation() {
        let ours = Version::parse("2.0");
        assert_eq!(
            related_operation(
                RelationType::Upgrade,
                &ours,
                &Version::parse("3.0"),
                BundleAction::Install
            ),
            RelatedOperation::Downgrade
        );
        assert_eq!(
            related_operation(
                RelationType::Patch,
                &ours,
                &Version::parse("1.0"),
                BundleAction::Uninstall
            ),
            RelatedOperation::Remove
        );
    }

    #[tokio::test]
    async fn test_condition_error_is_reported() {
        let mut model = BundleModel::from_toml(MANIFEST).unwrap();
        model.packages[0].install_condition = Some("(".into());
        let ba = Recorder(Mutex::new(Vec::new()));
        let err = detect(&mut model, &vars(), &ba, &snapshot(), BundleAction::Install)
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HResult::INVALID_DATA);
        assert!(matches!(
            ba.0.lock().unwrap().last(),
            Some(BaEvent::DetectComplete { status }) if *status == HResult::INVALID_DATA
        ));
    }

    #[tokio::test]
    async fn test_snapshot_records_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let snapshot = SystemSnapshot::open(&path).await.unwrap();
        let model = BundleModel::from_toml(MANIFEST).unwrap();

        let op = RegistrationOp::for_bundle(
            &model,
            &crate::plan::RegistrationAction::RegisterBundle,
            BTreeMap::new,
        );
        snapshot.apply(&op).await.unwrap();
        snapshot
            .apply(&RegistrationOp::RegisterDependent {
                provider_key: "sample.bundle".into(),
                dependent: "parent".into(),
            })
            .await
            .unwrap();

        let reopened = SystemSnapshot::open(&path).await.unwrap();
        let state = reopened.state();
        assert_eq!(state.bundles.len(), 1);
        assert!(state.providers["sample.bundle"].dependents.contains("parent"));

        reopened
            .apply(&RegistrationOp::UnregisterBundle {
                bundle_id: "{B0B0}".into(),
            })
            .await
            .unwrap();
        assert!(reopened.installed_bundles().is_empty());
        // The dependent keeps the provider alive.
        assert!(reopened.provider("sample.bundle").is_some());
    }
}
