//! Packages in the bundle chain.

use serde::{Deserialize, Serialize};

use super::state::{
    ActionState, CacheType, DependencyAction, FeatureAction, FeatureState, PackageState,
    RequestState,
};
use crate::version::Version;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Exe,
    Msi,
    Msp,
    Msu,
    Bundle,
}

/// Executable package.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExePackage {
    #[serde(default)]
    pub detect_condition: Option<String>,
    #[serde(default)]
    pub install_arguments: String,
    #[serde(default)]
    pub repair_arguments: Option<String>,
    #[serde(default)]
    pub uninstall_arguments: Option<String>,
}

impl ExePackage {
    pub fn repairable(&self) -> bool {
        self.repair_arguments.is_some()
    }

    pub fn uninstallable(&self) -> bool {
        self.uninstall_arguments.is_some()
    }
}

/// One feature of an MSI package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsiFeature {
    pub id: String,
    #[serde(default)]
    pub default_state: FeatureState,
    #[serde(skip)]
    pub current: FeatureState,
    #[serde(skip)]
    pub requested: FeatureState,
    #[serde(skip)]
    pub execute: FeatureAction,
    #[serde(skip)]
    pub rollback: FeatureAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsiPackage {
    pub product_code: String,
    pub version: Version,
    #[serde(default)]
    pub upgrade_code: Option<String>,
    #[serde(default)]
    pub features: Vec<MsiFeature>,
    /// Ids of MSP packages applied together with this package.
    #[serde(default)]
    pub slipstream_patches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MspPackage {
    pub patch_code: String,
    #[serde(default)]
    pub target_product_codes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsuPackage {
    pub kb: String,
    #[serde(default)]
    pub detect_condition: Option<String>,
}

/// A nested bundle run as a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlePackage {
    pub bundle_id: String,
    pub version: Version,
    #[serde(default)]
    pub install_arguments: String,
    #[serde(default)]
    pub repair_arguments: Option<String>,
    #[serde(default)]
    pub uninstall_arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PackageKind {
    Exe(ExePackage),
    Msi(MsiPackage),
    Msp(MspPackage),
    Msu(MsuPackage),
    Bundle(BundlePackage),
}

impl PackageKind {
    pub fn package_type(&self) -> PackageType {
        match self {
            PackageKind::Exe(_) => PackageType::Exe,
            PackageKind::Msi(_) => PackageType::Msi,
            PackageKind::Msp(_) => PackageType::Msp,
            PackageKind::Msu(_) => PackageType::Msu,
            PackageKind::Bundle(_) => PackageType::Bundle,
        }
    }
}

/// Dependency provider registered by a package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyProvider {
    pub key: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Provider authored inside the package itself rather than by the bundle.
    #[serde(default)]
    pub imported: bool,
}

/// A previously installed package that this one supersedes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatiblePackage {
    pub product_code: String,
    pub version: Version,
}

/// Fields written by Detect and Plan. Reset at the start of each pass.
#[derive(Debug, Clone, Default)]
pub struct PackageRuntime {
    pub current_state: PackageState,
    pub cached: bool,
    pub install_condition: bool,
    /// Dependents other than this bundle hold a reference on a provider.
    pub other_dependents: bool,
    pub compatible: Option<CompatiblePackage>,

    pub default_requested: RequestState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
    pub cache_planned: bool,
    pub provider_execute: DependencyAction,
    pub provider_rollback: DependencyAction,
}

fn default_true() -> bool {
    true
}

/// A chain entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    #[serde(flatten)]
    pub kind: PackageKind,

    #[serde(default = "default_true")]
    pub vital: bool,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default)]
    pub per_machine: bool,
    #[serde(default)]
    pub cache: CacheType,
    #[serde(default)]
    pub install_condition: Option<String>,
    /// Boundary that starts before this package when going forward.
    #[serde(default)]
    pub rollback_boundary: Option<String>,
    /// Boundary that starts before this package when going backward.
    #[serde(default)]
    pub rollback_boundary_backward: Option<String>,
    #[serde(default)]
    pub payloads: Vec<String>,
    #[serde(default)]
    pub install_size: u64,
    #[serde(default)]
    pub providers: Vec<DependencyProvider>,
    /// Variable receiving this package's log path.
    #[serde(default)]
    pub log_path_variable: Option<String>,

    #[serde(skip)]
    pub runtime: PackageRuntime,
}

impl Package {
    pub fn package_type(&self) -> PackageType {
        self.kind.package_type()
    }

    /// Whether an uninstall can be run at all.
    pub fn uninstallable(&self) -> bool {
        match &self.kind {
            PackageKind::Exe(exe) => exe.uninstallable(),
            PackageKind::Bundle(b) => b.uninstall_arguments.is_some(),
            PackageKind::Msu(_) => false,
            PackageKind::Msi(_) | PackageKind::Msp(_) => true,
        }
    }

    pub fn repairable(&self) -> bool {
        match &self.kind {
            PackageKind::Exe(exe) => exe.repairable(),
            PackageKind::Bundle(b) => b.repair_arguments.is_some(),
            PackageKind::Msu(_) => false,
            PackageKind::Msi(_) | PackageKind::Msp(_) => true,
        }
    }

    pub fn msi_features(&self) -> &[MsiFeature] {
        match &self.kind {
            PackageKind::Msi(msi) => &msi.features,
            _ => &[],
        }
    }

    /// Clear everything Detect and Plan derive.
    pub fn reset_runtime(&mut self) {
        self.runtime = PackageRuntime::default();
        if let PackageKind::Msi(msi) = &mut self.kind {
            for feature in &mut msi.features {
                feature.current = FeatureState::Unknown;
                feature.requested = FeatureState::Unknown;
                feature.execute = FeatureAction::None;
                feature.rollback = FeatureAction::None;
            }
        }
    }

    /// Clear only what Plan derives.
    pub fn reset_plan(&mut self) {
        let r = &mut self.runtime;
        r.default_requested = RequestState::None;
        r.requested = RequestState::None;
        r.execute = ActionState::None;
        r.rollback = ActionState::None;
        r.cache_planned = false;
        r.provider_execute = DependencyAction::None;
        r.provider_rollback = DependencyAction::None;
        if let PackageKind::Msi(msi) = &mut self.kind {
            for feature in &mut msi.features {
                feature.requested = FeatureState::Unknown;
                feature.execute = FeatureAction::None;
                feature.rollback = FeatureAction::None;
            }
        }
    }
}
