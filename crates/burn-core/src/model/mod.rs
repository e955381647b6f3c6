//! Bundle data model.
//!
//! The model is loaded once from the bundle manifest and then owned by the
//! engine context. Authoring fields are immutable after load; Detect and
//! Plan only write the runtime fields on packages, features and related
//! bundles.

pub mod package;
pub mod payload;
pub mod related;
pub mod state;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::variables::{Variables, VariableError, names};
use crate::variant::Variant;
use crate::version::Version;

pub use package::{
    BundlePackage, CompatiblePackage, DependencyProvider, ExePackage, MsiFeature, MsiPackage,
    MspPackage, MsuPackage, Package, PackageKind, PackageRuntime, PackageType,
};
pub use payload::{
    AttachedSection, Container, ContainerKind, DownloadSource, Packaging, Payload, Verification,
};
pub use related::{RelatedBundle, RelatedCodes, UpdateEntry, UpdateFeed};
pub use state::{
    ActionState, BundleAction, CacheType, DependencyAction, FeatureAction, FeatureState,
    PackageState, RelatedOperation, RelationType, RequestState, Restart,
};

/// Errors from loading or validating a bundle manifest.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(String),

    #[error("invalid manifest: {0}")]
    Validation(String),

    #[error(transparent)]
    Variable(#[from] VariableError),
}

/// Identity of the bundle itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleInfo {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub provider_key: String,
    #[serde(default)]
    pub per_machine: bool,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub related: RelatedCodes,
}

/// A rollback boundary. Rollback never walks past one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackBoundary {
    pub id: String,
    #[serde(default = "default_true")]
    pub vital: bool,
    /// Run the enclosed MSI packages inside one transaction.
    #[serde(default)]
    pub transaction: bool,
    #[serde(default)]
    pub log_path_variable: Option<String>,
}

fn default_true() -> bool {
    true
}

/// An allow-listed executable the bootstrapper application may launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedExe {
    pub id: String,
    /// Formatted path.
    pub path: String,
    /// Formatted arguments always passed first.
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleExtension {
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Numeric,
    #[default]
    String,
    Formatted,
    Version,
}

/// A variable declared by bundle authoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: VariableKind,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub persisted: bool,
}

/// The whole bundle: identity, chain and runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleModel {
    pub bundle: BundleInfo,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub payloads: Vec<Payload>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub rollback_boundaries: Vec<RollbackBoundary>,
    #[serde(default)]
    pub approved_exes: Vec<ApprovedExe>,
    #[serde(default)]
    pub extensions: Vec<BundleExtension>,
    #[serde(default)]
    pub variables: Vec<VariableDecl>,
    #[serde(default)]
    pub update: UpdateFeed,

    /// Directory external payloads and containers are read from.
    #[serde(skip)]
    pub source_directory: PathBuf,
    /// Set when Detect finds this bundle registered.
    #[serde(skip)]
    pub installed: bool,
    #[serde(skip)]
    pub related_bundles: Vec<RelatedBundle>,
    #[serde(skip)]
    pub updates: Vec<UpdateEntry>,
}

impl BundleModel {
    /// Load a manifest. `.json` files are read as JSON, anything else as TOML.
    pub async fn load(path: &Path) -> Result<Self, ModelError> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut model = if path.extension().is_some_and(|e| e == "json") {
            Self::from_json(&content)?
        } else {
            Self::from_toml(&content)?
        };
        model.source_directory = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        info!(
            bundle = %model.bundle.id,
            packages = model.packages.len(),
            path = %path.display(),
            "Loaded bundle manifest"
        );
        Ok(model)
    }

    pub fn from_toml(s: &str) -> Result<Self, ModelError> {
        let model: BundleModel = toml::from_str(s).map_err(|e| ModelError::Parse(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    pub fn from_json(s: &str) -> Result<Self, ModelError> {
        let model: BundleModel =
            serde_json::from_str(s).map_err(|e| ModelError::Parse(e.to_string()))?;
        model.validate()?;
        Ok(model)
    }

    /// Check cross references and payload verification rules.
    pub fn validate(&self) -> Result<(), ModelError> {
        unique("package", self.packages.iter().map(|p| p.id.as_str()))?;
        unique("payload", self.payloads.iter().map(|p| p.key.as_str()))?;
        unique("container", self.containers.iter().map(|c| c.id.as_str()))?;
        unique(
            "rollback boundary",
            self.rollback_boundaries.iter().map(|b| b.id.as_str()),
        )?;
        unique("approved exe", self.approved_exes.iter().map(|e| e.id.as_str()))?;

        for payload in &self.payloads {
            if let Some(container) = &payload.container
                && self.container(container).is_none()
            {
                return Err(invalid(format!(
                    "payload '{}' references unknown container '{container}'",
                    payload.key
                )));
            }
            if payload.packaging == Packaging::External
                && payload.verification == Verification::None
            {
                return Err(invalid(format!(
                    "external payload '{}' has no verification",
                    payload.key
                )));
            }
            if payload.ux && payload.packaging != Packaging::Embedded {
                return Err(invalid(format!(
                    "application payload '{}' must be embedded",
                    payload.key
                )));
            }
        }

        for package in &self.packages {
            for key in &package.payloads {
                if self.payload(key).is_none() {
                    return Err(invalid(format!(
                        "package '{}' references unknown payload '{key}'",
                        package.id
                    )));
                }
            }
            for boundary in [&package.rollback_boundary, &package.rollback_boundary_backward]
                .into_iter()
                .flatten()
            {
                if self.boundary(boundary).is_none() {
                    return Err(invalid(format!(
                        "package '{}' references unknown rollback boundary '{boundary}'",
                        package.id
                    )));
                }
            }
            if let PackageKind::Msi(msi) = &package.kind {
                for patch in &msi.slipstream_patches {
                    match self.package(patch).map(Package::package_type) {
                        Some(PackageType::Msp) => {}
                        _ => {
                            return Err(invalid(format!(
                                "package '{}' slipstreams '{patch}', which is not an MSP package",
                                package.id
                            )));
                        }
                    }
                }
            }
        }

        for extension in &self.extensions {
            if self.payload(&extension.payload).is_none() {
                return Err(invalid(format!(
                    "extension '{}' references unknown payload '{}'",
                    extension.id, extension.payload
                )));
            }
        }
        Ok(())
    }

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.id == id)
    }

    pub fn package_mut(&mut self, id: &str) -> Option<&mut Package> {
        self.packages.iter_mut().find(|p| p.id == id)
    }

    pub fn payload(&self, key: &str) -> Option<&Payload> {
        self.payloads.iter().find(|p| p.key == key)
    }

    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.id == id)
    }

    pub fn boundary(&self, id: &str) -> Option<&RollbackBoundary> {
        self.rollback_boundaries.iter().find(|b| b.id == id)
    }

    pub fn approved_exe(&self, id: &str) -> Option<&ApprovedExe> {
        self.approved_exes.iter().find(|e| e.id == id)
    }

    pub fn related_bundle_mut(&mut self, id: &str) -> Option<&mut RelatedBundle> {
        self.related_bundles.iter_mut().find(|b| b.bundle_id == id)
    }

    /// Whether any package or the bundle itself needs machine-wide rights.
    pub fn needs_elevation(&self) -> bool {
        self.bundle.per_machine || self.packages.iter().any(|p| p.per_machine)
    }

    /// Resolve attached containers against the running executable.
    pub fn resolve_attached_containers(&mut self, section: &AttachedSection) {
        for container in &mut self.containers {
            container.resolve_attached(section);
        }
    }

    /// Clear all Detect and Plan output.
    pub fn reset_detect(&mut self) {
        for package in &mut self.packages {
            package.reset_runtime();
        }
        self.related_bundles.clear();
        self.updates.clear();
        self.installed = false;
    }

    /// Clear Plan output only.
    pub fn reset_plan(&mut self) {
        for package in &mut self.packages {
            package.reset_plan();
        }
        for related in &mut self.related_bundles {
            related.default_requested = RequestState::None;
            related.requested = RequestState::None;
            related.execute = ActionState::None;
            related.rollback = ActionState::None;
        }
    }

    /// Declare authored variables and publish bundle identity built-ins.
    pub fn initialize_variables(&self, variables: &mut Variables) -> Result<(), ModelError> {
        variables.set_built_in(names::BUNDLE_NAME, Variant::string(&self.bundle.name))?;
        variables.set_built_in(
            names::BUNDLE_VERSION,
            Variant::version(self.bundle.version.clone()),
        )?;
        variables.set_built_in(
            names::BUNDLE_PROVIDER_KEY,
            Variant::string(&self.bundle.provider_key),
        )?;
        if let Some(tag) = &self.bundle.tag {
            variables.set_built_in(names::BUNDLE_TAG, Variant::string(tag))?;
        }
        variables.set_built_in(
            names::BUNDLE_ORIGINAL_SOURCE,
            Variant::string(&self.source_directory.to_string_lossy()),
        )?;

        for decl in &self.variables {
            let value = match (&decl.value, decl.kind) {
                (None, _) => Variant::none(),
                (Some(v), VariableKind::String) => Variant::string(v),
                (Some(v), VariableKind::Formatted) => Variant::formatted(v),
                (Some(v), VariableKind::Version) => Variant::version(Version::parse(v)),
                (Some(v), VariableKind::Numeric) => {
                    Variant::numeric(v.trim().parse::<i64>().map_err(|_| {
                        invalid(format!("variable '{}' is not numeric: {v:?}", decl.name))
                    })?)
                }
            };
            variables.declare(&decl.name, value, decl.hidden, decl.persisted)?;
        }
        debug!(count = self.variables.len(), "Declared bundle variables");
        Ok(())
    }
}

fn invalid(message: String) -> ModelError {
    ModelError::Validation(message)
}

fn unique<'a>(what: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            return Err(invalid(format!("{what} id must not be empty")));
        }
        if !seen.insert(id) {
            return Err(invalid(format!("duplicate {what} id '{id}'")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
        [bundle]
        id = "{B0B0}"
        name = "Sample"
        version = "1.2.0"
        provider_key = "sample.bundle"
        per_machine = true

        [[containers]]
        id = "WixAttachedContainer"
        format = "cabinet"
        attached = true

        [[payloads]]
        key = "app.msi"
        file_path = "app.msi"
        container = "WixAttachedContainer"
        size = 10

        [[payloads]]
        key = "redist.exe"
        file_path = "redist.exe"
        packaging = "external"
        size = 20
        verification = { method = "hash", sha256 = "00" }

        [[rollback_boundaries]]
        id = "rb1"
        transaction = true

        [[packages]]
        id = "Redist"
        type = "exe"
        install_arguments = "/quiet"
        detect_condition = "RedistInstalled"
        payloads = ["redist.exe"]
        permanent = true

        [[packages]]
        id = "App"
        type = "msi"
        product_code = "{AAAA}"
        version = "1.2.0"
        rollback_boundary = "rb1"
        payloads = ["app.msi"]
        per_machine = true
        features = [{ id = "Main" }]

        [[variables]]
        name = "InstallFolder"
        value = "[TempFolder]Sample"
        type = "formatted"
        persisted = true
    "#;

    #[test]
    fn test_parse_manifest() {
        let model = BundleModel::from_toml(MANIFEST).unwrap();
        assert_eq!(model.packages.len(), 2);
        assert_eq!(model.packages[0].package_type(), PackageType::Exe);
        assert!(model.packages[0].vital);
        assert!(model.packages[0].permanent);
        assert_eq!(model.packages[1].msi_features().len(), 1);
        assert!(model.needs_elevation());
        assert!(model.boundary("rb1").unwrap().transaction);
    }

    #[test]
    fn test_unverified_external_payload_rejected() {
        let broken = MANIFEST.replace(
            "verification = { method = \"hash\", sha256 = \"00\" }",
            "",
        );
        let err = BundleModel::from_toml(&broken).unwrap_err();
        assert!(err.to_string().contains("no verification"));
    }

    #[test]
    fn test_unknown_payload_reference_rejected() {
        let broken = MANIFEST.replace("payloads = [\"app.msi\"]", "payloads = [\"nope\"]");
        assert!(BundleModel::from_toml(&broken).is_err());
    }

    #[test]
    fn test_duplicate_package_rejected() {
        let broken = MANIFEST.replace("id = \"Redist\"", "id = \"App\"");
        assert!(matches!(
            BundleModel::from_toml(&broken),
            Err(ModelError::Validation(_))
        ));
    }

    #[test]
    fn test_initialize_variables() {
        let model = BundleModel::from_toml(MANIFEST).unwrap();
        let mut vars = Variables::new();
        vars.initialize_system().unwrap();
        model.initialize_variables(&mut vars).unwrap();
        assert_eq!(vars.get_string(names::BUNDLE_NAME).unwrap().as_str(), "Sample");
        let folder = vars.get_formatted("InstallFolder").unwrap();
        assert!(folder.ends_with("Sample"));
        assert!(!folder.contains('['));
    }

    #[test]
    fn test_reset_detect_clears_runtime() {
        let mut model = BundleModel::from_toml(MANIFEST).unwrap();
        model.packages[0].runtime.current_state = PackageState::Present;
        model.installed = true;
        model.reset_detect();
        assert_eq!(model.packages[0].runtime.current_state, PackageState::Unknown);
        assert!(!model.installed);
    }

    #[tokio::test]
    async fn test_load_sets_source_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bundle.toml");
        tokio::fs::write(&path, MANIFEST).await.unwrap();
        let model = BundleModel::load(&path).await.unwrap();
        assert_eq!(model.source_directory, dir.path());
    }
}
