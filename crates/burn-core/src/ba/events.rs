//! Engine-to-application callbacks.
//!
//! Every callback is a [`BaEvent`]; the application answers with a
//! [`BaReply`]. Only the reply fields meaningful for an event are read,
//! and any result code is filtered through the event's allowed results
//! before the engine acts on it.

use serde::{Deserialize, Serialize};

use crate::BoxFuture;
use crate::hresult::HResult;
use crate::model::{
    ActionState, BundleAction, FeatureState, PackageState, RelatedOperation, RelationType,
    RequestState, Restart,
};

/// How the engine was launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaCommand {
    pub action: Option<BundleAction>,
    #[serde(default)]
    pub relation_type: RelationType,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Category of an error shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    #[default]
    Elevate,
    WindowsInstaller,
    ExePackage,
    HttpServerAuth,
    HttpProxyAuth,
    Apply,
}

/// A user's answer to a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiResult {
    #[default]
    NoAction,
    Ok,
    Cancel,
    Abort,
    Retry,
    Ignore,
    Yes,
    No,
    TryAgain,
    Continue,
}

/// The answers a prompt declares it can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedResults {
    Ok,
    OkCancel,
    AbortRetryIgnore,
    YesNoCancel,
    YesNo,
    RetryCancel,
    CancelTryContinue,
    /// Retry or try-again only.
    RetryTryAgain,
}

impl AllowedResults {
    pub const ALL: [AllowedResults; 8] = [
        AllowedResults::Ok,
        AllowedResults::OkCancel,
        AllowedResults::AbortRetryIgnore,
        AllowedResults::YesNoCancel,
        AllowedResults::YesNo,
        AllowedResults::RetryCancel,
        AllowedResults::CancelTryContinue,
        AllowedResults::RetryTryAgain,
    ];

    /// Results this mask can produce besides `NoAction`.
    pub fn declared(self) -> &'static [UiResult] {
        use UiResult::*;
        match self {
            AllowedResults::Ok => &[Ok],
            AllowedResults::OkCancel => &[Ok, Cancel],
            AllowedResults::AbortRetryIgnore => &[Abort, Retry, Ignore],
            AllowedResults::YesNoCancel => &[Yes, No, Cancel],
            AllowedResults::YesNo => &[Yes, No],
            AllowedResults::RetryCancel => &[Retry, Cancel],
            AllowedResults::CancelTryContinue => &[Cancel, TryAgain, Continue],
            AllowedResults::RetryTryAgain => &[Retry, TryAgain],
        }
    }
}

impl UiResult {
    pub const ALL: [UiResult; 10] = [
        UiResult::NoAction,
        UiResult::Ok,
        UiResult::Cancel,
        UiResult::Abort,
        UiResult::Retry,
        UiResult::Ignore,
        UiResult::Yes,
        UiResult::No,
        UiResult::TryAgain,
        UiResult::Continue,
    ];

    /// Map a raw answer onto what `allowed` can act on.
    pub fn filter(self, allowed: AllowedResults) -> UiResult {
        use UiResult::*;
        match (allowed, self) {
            (_, NoAction) => NoAction,

            (AllowedResults::Ok, _) => Ok,

            (AllowedResults::OkCancel, Ok | Yes) => Ok,
            (AllowedResults::OkCancel, Cancel | Abort | No) => Cancel,

            (AllowedResults::AbortRetryIgnore, Cancel | Abort) => Abort,
            (AllowedResults::AbortRetryIgnore, Retry | TryAgain) => Retry,
            (AllowedResults::AbortRetryIgnore, Ignore | Continue) => Ignore,

            (AllowedResults::YesNoCancel, Ok | Yes) => Yes,
            (AllowedResults::YesNoCancel, No) => No,
            (AllowedResults::YesNoCancel, Cancel | Abort) => Cancel,

            (AllowedResults::YesNo, Ok | Yes) => Yes,
            (AllowedResults::YesNo, Cancel | Abort | No) => No,

            (AllowedResults::RetryCancel, Retry | TryAgain) => Retry,
            (AllowedResults::RetryCancel, Cancel | Abort) => Cancel,

            (AllowedResults::CancelTryContinue, Cancel | Abort) => Cancel,
            (AllowedResults::CancelTryContinue, Retry | TryAgain) => TryAgain,
            (AllowedResults::CancelTryContinue, Ignore | Continue) => Continue,

            (AllowedResults::RetryTryAgain, Retry) => Retry,
            (AllowedResults::RetryTryAgain, TryAgain) => TryAgain,

            _ => NoAction,
        }
    }

    /// Filter for a decision made while rolling back. Rollback cannot be
    /// cancelled, so cancel-style answers become `NoAction`.
    pub fn filter_rollback(self, allowed: AllowedResults) -> UiResult {
        match self.filter(allowed) {
            UiResult::Cancel | UiResult::Abort => UiResult::NoAction,
            other => other,
        }
    }

    pub fn is_cancel(self) -> bool {
        matches!(self, UiResult::Cancel | UiResult::Abort)
    }
}

/// A callback from the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BaEvent {
    Create {
        command: BaCommand,
    },
    Destroy {
        reload: bool,
    },
    Startup,
    Shutdown,

    DetectBegin {
        installed: bool,
        package_count: usize,
    },
    DetectRelatedBundle {
        bundle_id: String,
        relation: RelationType,
        version: String,
        per_machine: bool,
        operation: RelatedOperation,
    },
    DetectUpdateBegin {
        source: String,
    },
    DetectUpdate {
        source: String,
        version: String,
        size: u64,
        title: Option<String>,
    },
    DetectUpdateComplete {
        status: HResult,
    },
    DetectPackageBegin {
        package_id: String,
    },
    DetectCompatiblePackage {
        package_id: String,
        product_code: String,
        version: String,
    },
    DetectMsiFeature {
        package_id: String,
        feature_id: String,
        state: FeatureState,
    },
    DetectPackageComplete {
        package_id: String,
        status: HResult,
        state: PackageState,
        cached: bool,
    },
    DetectComplete {
        status: HResult,
    },

    PlanBegin {
        package_count: usize,
    },
    /// Reply `request_state` overrides `requested`.
    PlanRelatedBundle {
        bundle_id: String,
        requested: RequestState,
    },
    /// Reply `request_state` overrides `requested`.
    PlanPackageBegin {
        package_id: String,
        state: PackageState,
        cached: bool,
        install_condition: bool,
        requested: RequestState,
    },
    /// Reply `feature_state` overrides `requested`.
    PlanMsiFeature {
        package_id: String,
        feature_id: String,
        requested: FeatureState,
    },
    PlanPackageComplete {
        package_id: String,
        status: HResult,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    },
    PlanComplete {
        status: HResult,
    },

    ApplyBegin {
        phase_count: u32,
    },
    ElevateBegin,
    ElevateComplete {
        status: HResult,
    },
    RegisterBegin,
    RegisterComplete {
        status: HResult,
    },
    Progress {
        progress_percentage: u32,
        overall_percentage: u32,
    },
    /// Reply `result` is filtered through `allowed`.
    Error {
        error_type: ErrorType,
        package_id: Option<String>,
        code: HResult,
        message: String,
        allowed: AllowedResults,
        data: Vec<String>,
    },
    CacheBegin,
    CachePackageBegin {
        package_id: String,
        payload_count: usize,
        size: u64,
    },
    CacheAcquireBegin {
        id: String,
        source: Option<String>,
    },
    CacheAcquireProgress {
        id: String,
        progress: u64,
        total: u64,
        overall_percentage: u32,
    },
    /// A failed acquire may answer `Retry`.
    CacheAcquireComplete {
        id: String,
        status: HResult,
    },
    CacheVerifyComplete {
        package_id: String,
        payload_key: String,
        status: HResult,
    },
    CachePackageComplete {
        package_id: String,
        status: HResult,
    },
    CacheComplete {
        status: HResult,
    },
    ExecuteBegin {
        package_count: usize,
    },
    ExecutePackageBegin {
        package_id: String,
        execute: bool,
        action: ActionState,
    },
    ExecuteProgress {
        package_id: String,
        progress_percentage: u32,
        overall_percentage: u32,
    },
    /// A failure may answer `Retry` or `Ignore`.
    ExecutePackageComplete {
        package_id: String,
        status: HResult,
        restart: Restart,
    },
    ExecuteComplete {
        status: HResult,
    },
    UnregisterBegin,
    UnregisterComplete {
        status: HResult,
    },
    ApplyComplete {
        status: HResult,
        restart: Restart,
    },
    LaunchApprovedExeBegin,
    LaunchApprovedExeComplete {
        status: HResult,
        process_id: u32,
    },
}

impl BaEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            BaEvent::Create { .. } => "create",
            BaEvent::Destroy { .. } => "destroy",
            BaEvent::Startup => "startup",
            BaEvent::Shutdown => "shutdown",
            BaEvent::DetectBegin { .. } => "detect_begin",
            BaEvent::DetectRelatedBundle { .. } => "detect_related_bundle",
            BaEvent::DetectUpdateBegin { .. } => "detect_update_begin",
            BaEvent::DetectUpdate { .. } => "detect_update",
            BaEvent::DetectUpdateComplete { .. } => "detect_update_complete",
            BaEvent::DetectPackageBegin { .. } => "detect_package_begin",
            BaEvent::DetectCompatiblePackage { .. } => "detect_compatible_package",
            BaEvent::DetectMsiFeature { .. } => "detect_msi_feature",
            BaEvent::DetectPackageComplete { .. } => "detect_package_complete",
            BaEvent::DetectComplete { .. } => "detect_complete",
            BaEvent::PlanBegin { .. } => "plan_begin",
            BaEvent::PlanRelatedBundle { .. } => "plan_related_bundle",
            BaEvent::PlanPackageBegin { .. } => "plan_package_begin",
            BaEvent::PlanMsiFeature { .. } => "plan_msi_feature",
            BaEvent::PlanPackageComplete { .. } => "plan_package_complete",
            BaEvent::PlanComplete { .. } => "plan_complete",
            BaEvent::ApplyBegin { .. } => "apply_begin",
            BaEvent::ElevateBegin => "elevate_begin",
            BaEvent::ElevateComplete { .. } => "elevate_complete",
            BaEvent::RegisterBegin => "register_begin",
            BaEvent::RegisterComplete { .. } => "register_complete",
            BaEvent::Progress { .. } => "progress",
            BaEvent::Error { .. } => "error",
            BaEvent::CacheBegin => "cache_begin",
            BaEvent::CachePackageBegin { .. } => "cache_package_begin",
            BaEvent::CacheAcquireBegin { .. } => "cache_acquire_begin",
            BaEvent::CacheAcquireProgress { .. } => "cache_acquire_progress",
            BaEvent::CacheAcquireComplete { .. } => "cache_acquire_complete",
            BaEvent::CacheVerifyComplete { .. } => "cache_verify_complete",
            BaEvent::CachePackageComplete { .. } => "cache_package_complete",
            BaEvent::CacheComplete { .. } => "cache_complete",
            BaEvent::ExecuteBegin { .. } => "execute_begin",
            BaEvent::ExecutePackageBegin { .. } => "execute_package_begin",
            BaEvent::ExecuteProgress { .. } => "execute_progress",
            BaEvent::ExecutePackageComplete { .. } => "execute_package_complete",
            BaEvent::ExecuteComplete { .. } => "execute_complete",
            BaEvent::UnregisterBegin => "unregister_begin",
            BaEvent::UnregisterComplete { .. } => "unregister_complete",
            BaEvent::ApplyComplete { .. } => "apply_complete",
            BaEvent::LaunchApprovedExeBegin => "launch_approved_exe_begin",
            BaEvent::LaunchApprovedExeComplete { .. } => "launch_approved_exe_complete",
        }
    }
}

/// The application's answer to a callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaReply {
    /// Stop the current operation.
    #[serde(default)]
    pub cancel: bool,
    #[serde(default)]
    pub result: UiResult,
    #[serde(default)]
    pub request_state: Option<RequestState>,
    #[serde(default)]
    pub feature_state: Option<FeatureState>,
    /// Restart now (apply complete).
    #[serde(default)]
    pub restart: bool,
    /// Start the application again after it stops (shutdown).
    #[serde(default)]
    pub reload: bool,
}

impl BaReply {
    pub fn cancel() -> Self {
        Self {
            cancel: true,
            ..Self::default()
        }
    }

    pub fn result(result: UiResult) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn request(state: RequestState) -> Self {
        Self {
            request_state: Some(state),
            ..Self::default()
        }
    }

    /// Whether the application asked to stop, through either field.
    pub fn wants_cancel(&self) -> bool {
        self.cancel || self.result.is_cancel()
    }
}

/// The bootstrapper application as seen by the engine.
///
/// Implementations must not fail: an application that cannot be reached
/// answers as if it cancelled.
pub trait BootstrapperApplication: Send + Sync {
    fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply>;
}

/// Accepts every default. Used when no application is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBa;

impl BootstrapperApplication for NullBa {
    fn on_event(&self, _event: BaEvent) -> BoxFuture<'_, BaReply> {
        Box::pin(async { BaReply::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_ok_cancel() {
        assert_eq!(UiResult::Yes.filter(AllowedResults::OkCancel), UiResult::Ok);
        assert_eq!(
            UiResult::Ignore.filter(AllowedResults::OkCancel),
            UiResult::NoAction
        );
        assert_eq!(
            UiResult::Abort.filter(AllowedResults::OkCancel),
            UiResult::Cancel
        );
    }

    #[test]
    fn test_filter_yes_no() {
        let allowed = AllowedResults::YesNo;
        assert_eq!(UiResult::Ok.filter(allowed), UiResult::Yes);
        assert_eq!(UiResult::Yes.filter(allowed), UiResult::Yes);
        assert_eq!(UiResult::Cancel.filter(allowed), UiResult::No);
        assert_eq!(UiResult::Abort.filter(allowed), UiResult::No);
        assert_eq!(UiResult::Retry.filter(allowed), UiResult::NoAction);
        assert_eq!(UiResult::Continue.filter(allowed), UiResult::NoAction);
    }

    #[test]
    fn test_filter_retry_cancel() {
        let allowed = AllowedResults::RetryCancel;
        assert_eq!(UiResult::TryAgain.filter(allowed), UiResult::Retry);
        assert_eq!(UiResult::Retry.filter(allowed), UiResult::Retry);
        assert_eq!(UiResult::Abort.filter(allowed), UiResult::Cancel);
        assert_eq!(UiResult::Ignore.filter(allowed), UiResult::NoAction);
        assert_eq!(UiResult::Ok.filter(allowed), UiResult::NoAction);
        assert_eq!(
            UiResult::Cancel.filter_rollback(allowed),
            UiResult::NoAction
        );
    }

    #[test]
    fn test_filter_retry_try_again() {
        let allowed = AllowedResults::RetryTryAgain;
        assert_eq!(UiResult::Retry.filter(allowed), UiResult::Retry);
        assert_eq!(UiResult::TryAgain.filter(allowed), UiResult::TryAgain);
        for raw in [UiResult::Cancel, UiResult::Abort, UiResult::Ok, UiResult::Ignore] {
            assert_eq!(raw.filter(allowed), UiResult::NoAction, "{raw:?}");
        }
    }

    #[test]
    fn test_filter_stays_inside_declared_set() {
        for allowed in AllowedResults::ALL {
            for raw in UiResult::ALL {
                let filtered = raw.filter(allowed);
                assert!(
                    filtered == UiResult::NoAction || allowed.declared().contains(&filtered),
                    "{raw:?} through {allowed:?} gave {filtered:?}"
                );
            }
        }
    }

    #[test]
    fn test_rollback_cannot_be_cancelled() {
        for allowed in AllowedResults::ALL {
            for raw in UiResult::ALL {
                assert!(!raw.filter_rollback(allowed).is_cancel());
            }
        }
        assert_eq!(
            UiResult::Retry.filter_rollback(AllowedResults::AbortRetryIgnore),
            UiResult::Retry
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = BaEvent::PlanPackageBegin {
            package_id: "app".into(),
            state: PackageState::Absent,
            cached: false,
            install_condition: true,
            requested: RequestState::Present,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "plan_package_begin");
        assert_eq!(json["requested"], "present");
        let back: BaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_reply_defaults() {
        let reply: BaReply = serde_json::from_str("{}").unwrap();
        assert_eq!(reply, BaReply::default());
        assert!(BaReply::result(UiResult::Cancel).wants_cancel());
        assert!(!BaReply::request(RequestState::Absent).wants_cancel());
    }
}
