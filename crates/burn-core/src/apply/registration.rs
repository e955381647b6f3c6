//! Bundle, dependent and provider registration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::BoxFuture;
use crate::hresult::HResult;
use crate::model::{BundleModel, DependencyAction, Package};
use crate::plan::{ExecuteAction, RegistrationAction};
use crate::version::Version;

/// What gets written when a bundle registers itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRegistration {
    pub bundle_id: String,
    pub name: String,
    pub version: Version,
    pub provider_key: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub per_machine: bool,
    /// Upgrade codes used by later bundles to find this one.
    #[serde(default)]
    pub upgrade_codes: Vec<String>,
    /// Persisted variables restored on the next run.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl BundleRegistration {
    pub fn from_model(model: &BundleModel, variables: BTreeMap<String, String>) -> Self {
        Self {
            bundle_id: model.bundle.id.clone(),
            name: model.bundle.name.clone(),
            version: model.bundle.version.clone(),
            provider_key: model.bundle.provider_key.clone(),
            tag: model.bundle.tag.clone(),
            per_machine: model.bundle.per_machine,
            upgrade_codes: model.bundle.related.upgrade.clone(),
            variables,
        }
    }
}

/// One registration change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistrationOp {
    RegisterBundle(BundleRegistration),
    UnregisterBundle {
        bundle_id: String,
    },
    /// Add `dependent` to the references held on `provider_key`.
    RegisterDependent {
        provider_key: String,
        dependent: String,
    },
    UnregisterDependent {
        provider_key: String,
        dependent: String,
    },
    RegisterProvider {
        package_id: String,
        provider_key: String,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },
    UnregisterProvider {
        package_id: String,
        provider_key: String,
    },
}

impl RegistrationOp {
    /// Operations for a bundle-level action.
    pub fn for_bundle(
        model: &BundleModel,
        action: &RegistrationAction,
        variables: impl FnOnce() -> BTreeMap<String, String>,
    ) -> Self {
        let provider_key = model.bundle.provider_key.clone();
        match action {
            RegistrationAction::RegisterBundle => {
                RegistrationOp::RegisterBundle(BundleRegistration::from_model(model, variables()))
            }
            RegistrationAction::UnregisterBundle => RegistrationOp::UnregisterBundle {
                bundle_id: model.bundle.id.clone(),
            },
            RegistrationAction::RegisterDependent { dependent } => {
                RegistrationOp::RegisterDependent {
                    provider_key,
                    dependent: dependent.clone(),
                }
            }
            RegistrationAction::UnregisterDependent { dependent } => {
                RegistrationOp::UnregisterDependent {
                    provider_key,
                    dependent: dependent.clone(),
                }
            }
        }
    }

    /// Operations for a provider or dependency execute action. Empty for
    /// other actions.
    pub fn for_package(package: &Package, action: &ExecuteAction) -> Vec<Self> {
        match action {
            ExecuteAction::PackageProvider { action, .. } => package
                .providers
                .iter()
                .filter(|p| !p.imported)
                .filter_map(|p| match action {
                    DependencyAction::Register => Some(RegistrationOp::RegisterProvider {
                        package_id: package.id.clone(),
                        provider_key: p.key.clone(),
                        version: p.version.clone(),
                        display_name: p.display_name.clone(),
                    }),
                    DependencyAction::Unregister => Some(RegistrationOp::UnregisterProvider {
                        package_id: package.id.clone(),
                        provider_key: p.key.clone(),
                    }),
                    DependencyAction::None => None,
                })
                .collect(),
            ExecuteAction::PackageDependency {
                bundle_provider_key,
                action,
                ..
            } => package
                .providers
                .iter()
                .filter_map(|p| match action {
                    DependencyAction::Register => Some(RegistrationOp::RegisterDependent {
                        provider_key: p.key.clone(),
                        dependent: bundle_provider_key.clone(),
                    }),
                    DependencyAction::Unregister => Some(RegistrationOp::UnregisterDependent {
                        provider_key: p.key.clone(),
                        dependent: bundle_provider_key.clone(),
                    }),
                    DependencyAction::None => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Writes registration state.
pub trait Registrar: Send + Sync {
    fn apply<'a>(&'a self, op: &'a RegistrationOp) -> BoxFuture<'a, Result<(), HResult>>;
}
