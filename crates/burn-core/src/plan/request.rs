//! Fixed decision tables used by the planner.
//!
//! Every function here is pure: the same inputs always give the same
//! answer, which is what makes re-planning idempotent.

use crate::model::{
    ActionState, BundleAction, FeatureAction, FeatureState, Package, PackageKind, PackageState,
    PackageType, RelationType, RequestState,
};

/// Inputs to [`default_package_request_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInputs {
    pub package_type: PackageType,
    pub current: PackageState,
    pub action: BundleAction,
    pub install_condition: bool,
    pub relation: RelationType,
}

impl RequestInputs {
    pub fn for_package(package: &Package, action: BundleAction, relation: RelationType) -> Self {
        Self {
            package_type: package.package_type(),
            current: package.runtime.current_state,
            action,
            install_condition: package.runtime.install_condition,
            relation,
        }
    }
}

fn installs(action: BundleAction) -> bool {
    matches!(
        action,
        BundleAction::Install
            | BundleAction::Modify
            | BundleAction::Repair
            | BundleAction::UpdateReplace
            | BundleAction::UpdateReplaceEmbedded
    )
}

/// What a package should become before the application has its say.
pub fn default_package_request_state(inputs: RequestInputs) -> RequestState {
    let RequestInputs {
        package_type,
        current,
        action,
        install_condition,
        relation,
    } = inputs;

    if action == BundleAction::Layout {
        return RequestState::Cache;
    }

    if relation == RelationType::Patch && package_type == PackageType::Msp {
        return match action {
            BundleAction::Install | BundleAction::Modify | BundleAction::Repair
                if current == PackageState::Absent =>
            {
                RequestState::Present
            }
            BundleAction::Uninstall => RequestState::Absent,
            _ => RequestState::None,
        };
    }

    if current == PackageState::Superseded && action > BundleAction::Uninstall {
        return RequestState::None;
    }

    if current == PackageState::Obsolete {
        return if package_type == PackageType::Msp && action == BundleAction::Uninstall {
            RequestState::Absent
        } else {
            RequestState::None
        };
    }

    let requested = match action {
        BundleAction::Uninstall => RequestState::Absent,
        BundleAction::Repair => RequestState::Repair,
        BundleAction::Cache => RequestState::Cache,
        BundleAction::Install | BundleAction::UpdateReplace | BundleAction::UpdateReplaceEmbedded => {
            RequestState::Present
        }
        BundleAction::Modify => {
            if current == PackageState::Present {
                RequestState::Present
            } else {
                RequestState::None
            }
        }
        BundleAction::Unknown | BundleAction::Help | BundleAction::Layout => RequestState::None,
    };

    if installs(action)
        && !install_condition
        && matches!(
            requested,
            RequestState::Present | RequestState::Repair | RequestState::Mend
        )
    {
        return RequestState::Absent;
    }
    requested
}

fn is_present(state: PackageState) -> bool {
    matches!(
        state,
        PackageState::Present | PackageState::Superseded | PackageState::Obsolete
    )
}

/// Execute and rollback action for a package given its requested state.
///
/// `features_changed` is true when an installed MSI package has feature
/// actions to run.
pub fn package_action_states(
    package: &Package,
    requested: RequestState,
    features_changed: bool,
) -> (ActionState, ActionState) {
    let runtime = &package.runtime;
    let present = is_present(runtime.current_state);

    match requested {
        RequestState::Present => {
            if present {
                if features_changed && runtime.current_state == PackageState::Present {
                    (ActionState::Modify, ActionState::Modify)
                } else {
                    (ActionState::None, ActionState::None)
                }
            } else {
                let rollback = if package.permanent || !package.uninstallable() {
                    ActionState::None
                } else {
                    ActionState::Uninstall
                };
                (ActionState::Install, rollback)
            }
        }
        RequestState::Repair => {
            if present {
                if package.repairable() {
                    (ActionState::Repair, ActionState::None)
                } else {
                    (ActionState::None, ActionState::None)
                }
            } else {
                let rollback = if package.permanent || !package.uninstallable() {
                    ActionState::None
                } else {
                    ActionState::Uninstall
                };
                (ActionState::Install, rollback)
            }
        }
        RequestState::Mend => {
            if present {
                (ActionState::Mend, ActionState::None)
            } else {
                (ActionState::Install, ActionState::Uninstall)
            }
        }
        RequestState::Absent | RequestState::ForceAbsent => {
            let forced = requested == RequestState::ForceAbsent;
            if !present
                || package.permanent
                || !package.uninstallable()
                || (runtime.other_dependents && !forced)
            {
                (ActionState::None, ActionState::None)
            } else {
                let rollback = if runtime.cached {
                    ActionState::Install
                } else {
                    ActionState::None
                };
                (ActionState::Uninstall, rollback)
            }
        }
        RequestState::Cache | RequestState::None => (ActionState::None, ActionState::None),
    }
}

/// Default requested state of an MSI feature.
pub fn default_feature_state(
    current: FeatureState,
    authored: FeatureState,
    package_requested: RequestState,
    package_current: PackageState,
) -> FeatureState {
    match package_requested {
        RequestState::Present | RequestState::Repair | RequestState::Mend => {
            if current == FeatureState::Local {
                FeatureState::Local
            } else if package_current != PackageState::Present {
                if authored == FeatureState::Unknown {
                    FeatureState::Local
                } else {
                    authored
                }
            } else {
                FeatureState::Absent
            }
        }
        RequestState::Absent | RequestState::ForceAbsent => FeatureState::Absent,
        RequestState::Cache | RequestState::None => current,
    }
}

/// Execute and rollback action for a feature.
pub fn feature_actions(
    current: FeatureState,
    requested: FeatureState,
    repair: bool,
) -> (FeatureAction, FeatureAction) {
    let installed = matches!(
        current,
        FeatureState::Local | FeatureState::Source | FeatureState::Advertised
    );
    match requested {
        FeatureState::Local if !installed => (FeatureAction::AddLocal, FeatureAction::Remove),
        FeatureState::Source if !installed => (FeatureAction::AddSource, FeatureAction::Remove),
        FeatureState::Advertised if !installed => {
            (FeatureAction::Advertise, FeatureAction::Remove)
        }
        FeatureState::Absent if installed => {
            let rollback = match current {
                FeatureState::Source => FeatureAction::AddSource,
                FeatureState::Advertised => FeatureAction::Advertise,
                _ => FeatureAction::AddLocal,
            };
            (FeatureAction::Remove, rollback)
        }
        _ if installed && repair => (FeatureAction::Reinstall, FeatureAction::None),
        _ => (FeatureAction::None, FeatureAction::None),
    }
}

/// Default requested state of a related bundle.
pub fn default_related_request_state(
    relation: RelationType,
    command_relation: RelationType,
    older: bool,
    action: BundleAction,
) -> RequestState {
    if command_relation != RelationType::None {
        return RequestState::None;
    }
    match relation {
        RelationType::Upgrade => {
            if older && installs(action) {
                RequestState::Absent
            } else {
                RequestState::None
            }
        }
        RelationType::Addon | RelationType::Patch => match action {
            BundleAction::Uninstall => RequestState::Absent,
            BundleAction::Repair => RequestState::Repair,
            _ => RequestState::None,
        },
        _ => RequestState::None,
    }
}

/// Whether the package's MSI features have anything to do.
pub fn msi_features_changed(package: &Package) -> bool {
    match &package.kind {
        PackageKind::Msi(msi) => msi
            .features
            .iter()
            .any(|f| f.execute != FeatureAction::None),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn inputs(
        package_type: PackageType,
        current: PackageState,
        action: BundleAction,
    ) -> RequestInputs {
        RequestInputs {
            package_type,
            current,
            action,
            install_condition: true,
            relation: RelationType::None,
        }
    }

    #[test]
    fn test_basic_actions() {
        let absent = |action| {
            default_package_request_state(inputs(PackageType::Exe, PackageState::Absent, action))
        };
        assert_eq!(absent(BundleAction::Install), RequestState::Present);
        assert_eq!(absent(BundleAction::Uninstall), RequestState::Absent);
        assert_eq!(absent(BundleAction::Repair), RequestState::Repair);
        assert_eq!(absent(BundleAction::Layout), RequestState::Cache);
        assert_eq!(absent(BundleAction::Modify), RequestState::None);
        assert_eq!(absent(BundleAction::Help), RequestState::None);
    }

    #[test]
    fn test_false_install_condition_requests_absent() {
        let mut i = inputs(PackageType::Msi, PackageState::Present, BundleAction::Install);
        i.install_condition = false;
        assert_eq!(default_package_request_state(i), RequestState::Absent);
        i.action = BundleAction::Uninstall;
        assert_eq!(default_package_request_state(i), RequestState::Absent);
        i.action = BundleAction::Cache;
        assert_eq!(default_package_request_state(i), RequestState::Cache);
    }

    #[test]
    fn test_obsolete_and_superseded() {
        assert_eq!(
            default_package_request_state(inputs(
                PackageType::Msi,
                PackageState::Obsolete,
                BundleAction::Uninstall
            )),
            RequestState::None
        );
        assert_eq!(
            default_package_request_state(inputs(
                PackageType::Msp,
                PackageState::Obsolete,
                BundleAction::Uninstall
            )),
            RequestState::Absent
        );
        assert_eq!(
            default_package_request_state(inputs(
                PackageType::Msp,
                PackageState::Superseded,
                BundleAction::Install
            )),
            RequestState::None
        );
        assert_eq!(
            default_package_request_state(inputs(
                PackageType::Msp,
                PackageState::Superseded,
                BundleAction::Uninstall
            )),
            RequestState::Absent
        );
    }

    #[test]
    fn test_patch_relation() {
        let mut i = inputs(PackageType::Msp, PackageState::Absent, BundleAction::Repair);
        i.relation = RelationType::Patch;
        assert_eq!(default_package_request_state(i), RequestState::Present);
        i.current = PackageState::Present;
        assert_eq!(default_package_request_state(i), RequestState::None);
        i.action = BundleAction::Uninstall;
        assert_eq!(default_package_request_state(i), RequestState::Absent);
    }

    #[test]
    fn test_table_is_deterministic() {
        let types = [
            PackageType::Exe,
            PackageType::Msi,
            PackageType::Msp,
            PackageType::Msu,
            PackageType::Bundle,
        ];
        let states = [
            PackageState::Unknown,
            PackageState::Obsolete,
            PackageState::Absent,
            PackageState::Cached,
            PackageState::Present,
            PackageState::Superseded,
        ];
        let actions = [
            BundleAction::Unknown,
            BundleAction::Help,
            BundleAction::Layout,
            BundleAction::Uninstall,
            BundleAction::Cache,
            BundleAction::Install,
            BundleAction::Modify,
            BundleAction::Repair,
            BundleAction::UpdateReplace,
            BundleAction::UpdateReplaceEmbedded,
        ];
        let relations = [RelationType::None, RelationType::Patch, RelationType::Upgrade];
        for package_type in types {
            for current in states {
                for action in actions {
                    for relation in relations {
                        for install_condition in [true, false] {
                            let i = RequestInputs {
                                package_type,
                                current,
                                action,
                                install_condition,
                                relation,
                            };
                            let first = default_package_request_state(i);
                            for _ in 0..3 {
                                assert_eq!(default_package_request_state(i), first);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_feature_actions() {
        assert_eq!(
            feature_actions(FeatureState::Absent, FeatureState::Local, false),
            (FeatureAction::AddLocal, FeatureAction::Remove)
        );
        assert_eq!(
            feature_actions(FeatureState::Local, FeatureState::Absent, false),
            (FeatureAction::Remove, FeatureAction::AddLocal)
        );
        assert_eq!(
            feature_actions(FeatureState::Local, FeatureState::Local, true),
            (FeatureAction::Reinstall, FeatureAction::None)
        );
        assert_eq!(
            feature_actions(FeatureState::Local, FeatureState::Local, false),
            (FeatureAction::None, FeatureAction::None)
        );
    }

    #[test]
    fn test_related_table() {
        use RelationType as R;
        assert_eq!(
            default_related_request_state(R::Upgrade, R::None, true, BundleAction::Install),
            RequestState::Absent
        );
        assert_eq!(
            default_related_request_state(R::Upgrade, R::None, false, BundleAction::Install),
            RequestState::None
        );
        assert_eq!(
            default_related_request_state(R::Upgrade, R::Upgrade, true, BundleAction::Install),
            RequestState::None
        );
        assert_eq!(
            default_related_request_state(R::Addon, R::None, false, BundleAction::Uninstall),
            RequestState::Absent
        );
        assert_eq!(
            default_related_request_state(R::Patch, R::None, false, BundleAction::Repair),
            RequestState::Repair
        );
        assert_eq!(
            default_related_request_state(R::Detect, R::None, true, BundleAction::Uninstall),
            RequestState::None
        );
    }
}
