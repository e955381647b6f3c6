//! Planned actions.
//!
//! Actions are referenced by index while the plan is built, so an action
//! that turns out to be unnecessary is tombstoned with `deleted` instead of
//! being removed.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use tokio::sync::watch;

use crate::hresult::HResult;
use crate::model::{ActionState, DependencyAction, FeatureAction};

/// An action plus its tombstone flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Planned<T> {
    #[serde(flatten)]
    pub action: T,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl<T> Planned<T> {
    pub fn new(action: T) -> Self {
        Self {
            action,
            deleted: false,
        }
    }

    pub fn live(&self) -> Option<&T> {
        (!self.deleted).then_some(&self.action)
    }
}

/// Progress of one package's cache work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Pending,
    Complete,
    Failed(HResult),
}

/// Signalled by the cache side when a package is cached, awaited by the
/// execute side before running the package.
#[derive(Debug, Clone)]
pub struct CacheSyncPoint {
    package_id: String,
    sender: Arc<watch::Sender<CacheStatus>>,
}

impl CacheSyncPoint {
    pub fn new(package_id: &str) -> Self {
        let (sender, _) = watch::channel(CacheStatus::Pending);
        Self {
            package_id: package_id.to_string(),
            sender: Arc::new(sender),
        }
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn status(&self) -> CacheStatus {
        *self.sender.borrow()
    }

    /// Re-arm before a new apply.
    pub fn reset(&self) {
        self.sender.send_replace(CacheStatus::Pending);
    }

    /// Set the final status. Later signals are ignored.
    pub fn signal(&self, status: CacheStatus) {
        self.sender.send_if_modified(|current| {
            if *current == CacheStatus::Pending {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    /// Wait until the package is no longer pending.
    pub async fn wait(&self) -> CacheStatus {
        let mut receiver = self.sender.subscribe();
        match receiver
            .wait_for(|status| *status != CacheStatus::Pending)
            .await
        {
            Ok(status) => *status,
            // Sender is owned by self, so the channel cannot close here.
            Err(_) => CacheStatus::Failed(HResult::E_ABORT),
        }
    }
}

impl PartialEq for CacheSyncPoint {
    fn eq(&self, other: &Self) -> bool {
        self.package_id == other.package_id
    }
}

impl Serialize for CacheSyncPoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.package_id)
    }
}

/// An MSI feature change carried on an MSI action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureChange {
    pub feature_id: String,
    pub action: FeatureAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecuteAction {
    Checkpoint {
        id: u32,
        boundary: Option<String>,
    },
    WaitForCache {
        sync: CacheSyncPoint,
    },
    ExePackage {
        package_id: String,
        action: ActionState,
    },
    MsiPackage {
        package_id: String,
        action: ActionState,
        features: Vec<FeatureChange>,
        slipstream: Vec<String>,
    },
    MspTarget {
        package_id: String,
        target_product_code: String,
        action: ActionState,
    },
    MsuPackage {
        package_id: String,
        action: ActionState,
    },
    BundlePackage {
        package_id: String,
        action: ActionState,
    },
    RelatedBundle {
        bundle_id: String,
        action: ActionState,
    },
    PackageProvider {
        package_id: String,
        action: DependencyAction,
    },
    PackageDependency {
        package_id: String,
        bundle_provider_key: String,
        action: DependencyAction,
    },
    RollbackBoundaryStart {
        boundary_id: String,
        vital: bool,
        transaction: bool,
    },
    RollbackBoundaryEnd {
        boundary_id: String,
    },
    BeginMsiTransaction {
        boundary_id: String,
    },
    CommitMsiTransaction {
        boundary_id: String,
    },
}

impl ExecuteAction {
    /// Package or related bundle this action runs, if any.
    pub fn package_id(&self) -> Option<&str> {
        match self {
            ExecuteAction::ExePackage { package_id, .. }
            | ExecuteAction::MsiPackage { package_id, .. }
            | ExecuteAction::MspTarget { package_id, .. }
            | ExecuteAction::MsuPackage { package_id, .. }
            | ExecuteAction::BundlePackage { package_id, .. } => Some(package_id),
            ExecuteAction::RelatedBundle { bundle_id, .. } => Some(bundle_id),
            _ => None,
        }
    }

    /// Whether this action runs a package (one progress tick).
    pub fn is_package(&self) -> bool {
        self.package_id().is_some()
    }

    pub fn action_state(&self) -> Option<ActionState> {
        match self {
            ExecuteAction::ExePackage { action, .. }
            | ExecuteAction::MsiPackage { action, .. }
            | ExecuteAction::MspTarget { action, .. }
            | ExecuteAction::MsuPackage { action, .. }
            | ExecuteAction::BundlePackage { action, .. }
            | ExecuteAction::RelatedBundle { action, .. } => Some(*action),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheAction {
    Checkpoint {
        id: u32,
    },
    LayoutBundle {
        layout_directory: PathBuf,
    },
    PackageStart {
        package_id: String,
        payload_count: usize,
        size: u64,
    },
    AcquireContainer {
        container_id: String,
    },
    /// Payload keys are appended while later packages are planned.
    ExtractContainer {
        container_id: String,
        payload_keys: Vec<String>,
    },
    AcquirePayload {
        payload_key: String,
    },
    CachePayload {
        package_id: String,
        payload_key: String,
    },
    LayoutPayload {
        payload_key: String,
        layout_directory: PathBuf,
    },
    PackageStop {
        package_id: String,
    },
    SignalSyncPoint {
        sync: CacheSyncPoint,
    },
    /// Remove what this apply cached for a package.
    RollbackPackage {
        package_id: String,
    },
}

/// Bundle-level registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistrationAction {
    RegisterBundle,
    UnregisterBundle,
    /// Register `dependent` on this bundle's provider key.
    RegisterDependent { dependent: String },
    UnregisterDependent { dependent: String },
}

impl RegistrationAction {
    /// Registrations run before caching, unregistrations after execute.
    pub fn is_register(&self) -> bool {
        matches!(
            self,
            RegistrationAction::RegisterBundle | RegistrationAction::RegisterDependent { .. }
        )
    }
}

/// Work done only after a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CleanAction {
    UncachePackage {
        package_id: String,
    },
    /// Remove a superseded product left behind by an older package.
    RemoveCompatible {
        package_id: String,
        product_code: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_point_wakes_waiter() {
        let sync = CacheSyncPoint::new("app");
        let waiter = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.wait().await })
        };
        tokio::task::yield_now().await;
        sync.signal(CacheStatus::Complete);
        assert_eq!(waiter.await.unwrap(), CacheStatus::Complete);
    }

    #[tokio::test]
    async fn test_sync_point_first_signal_wins() {
        let sync = CacheSyncPoint::new("app");
        sync.signal(CacheStatus::Failed(HResult::E_FAIL));
        sync.signal(CacheStatus::Complete);
        assert_eq!(sync.wait().await, CacheStatus::Failed(HResult::E_FAIL));
        sync.reset();
        assert_eq!(sync.status(), CacheStatus::Pending);
    }

    #[test]
    fn test_serialized_shape() {
        let action = Planned::new(ExecuteAction::WaitForCache {
            sync: CacheSyncPoint::new("app"),
        });
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["kind"], "wait_for_cache");
        assert_eq!(json["sync"], "app");
        assert!(json.get("deleted").is_none());
    }
}
