//! State enums shared by Detect, Plan and Apply.

use serde::{Deserialize, Serialize};

/// The operation the bootstrapper application asked for.
///
/// Declaration order matters: plan rules compare actions with `<`/`>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleAction {
    Unknown,
    Help,
    Layout,
    Uninstall,
    Cache,
    Install,
    Modify,
    Repair,
    UpdateReplace,
    UpdateReplaceEmbedded,
}

impl BundleAction {
    /// Numeric value published through the `WixBundleAction` variable.
    pub fn as_number(self) -> i64 {
        self as i64
    }
}

/// What Detect found for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Unknown,
    Obsolete,
    Absent,
    Cached,
    Present,
    Superseded,
}

/// What Plan asks a package to become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    None,
    ForceAbsent,
    Absent,
    Cache,
    Present,
    Mend,
    Repair,
}

/// The concrete operation run against a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    #[default]
    None,
    Uninstall,
    Install,
    Modify,
    Mend,
    Repair,
    MinorUpgrade,
}

/// How another bundle relates to this one, or why this bundle was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    #[default]
    None,
    Detect,
    Upgrade,
    Addon,
    Patch,
    Dependent,
    Update,
    ChainPackage,
}

/// What Detect infers a related bundle operation would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelatedOperation {
    #[default]
    None,
    Downgrade,
    MinorUpdate,
    MajorUpgrade,
    Remove,
    Install,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureState {
    #[default]
    Unknown,
    Absent,
    Advertised,
    Local,
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAction {
    #[default]
    None,
    AddLocal,
    AddSource,
    AddDefault,
    Reinstall,
    Advertise,
    Remove,
}

/// How long a package's payloads stay in the package cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// Removed once the package is installed.
    Remove,
    /// Kept while the package is installed.
    #[default]
    Keep,
    /// Cached even when nothing would otherwise need it.
    Force,
}

/// Dependency provider registration to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyAction {
    #[default]
    None,
    Register,
    Unregister,
}

/// Restart requirement. Results merge by taking the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Restart {
    #[default]
    None,
    Required,
    Initiated,
}

impl Restart {
    pub fn merge(self, other: Restart) -> Restart {
        self.max(other)
    }
}
