//! Package adapter capability and the command-line implementation.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::ApplyError;
use crate::BoxFuture;
use crate::ba::events::{AllowedResults, UiResult};
use crate::hresult::HResult;
use crate::model::{ActionState, BundleModel, FeatureAction, PackageKind, Restart};
use crate::plan::{ExecuteAction, FeatureChange};
use crate::variables::Variables;

/// What an operation runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    Exe,
    Msi {
        product_code: String,
    },
    MspTarget {
        patch_code: String,
        target_product_code: String,
    },
    Msu {
        kb: String,
    },
    Bundle,
    RelatedBundle,
    /// A superseded product left on the machine.
    Compatible {
        product_code: String,
    },
}

/// One self-contained package operation. Carries everything an executor
/// needs, so it can be sent to the companion as-is.
#[derive(Clone, Serialize, Deserialize)]
pub struct PackageOperation {
    pub package_id: String,
    pub kind: OperationKind,
    pub action: ActionState,
    pub rollback: bool,
    #[serde(default)]
    pub per_machine: bool,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Formatted arguments. May contain secrets.
    #[serde(default)]
    pub arguments: String,
    /// Arguments with hidden variables masked.
    #[serde(default)]
    pub log_arguments: String,
    #[serde(default)]
    pub features: Vec<FeatureChange>,
    /// Cached paths of patches applied with an MSI package.
    #[serde(default)]
    pub slipstream: Vec<PathBuf>,
}

impl fmt::Debug for PackageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageOperation")
            .field("package_id", &self.package_id)
            .field("kind", &self.kind)
            .field("action", &self.action)
            .field("rollback", &self.rollback)
            .field("executable", &self.executable)
            .field("arguments", &self.log_arguments)
            .finish_non_exhaustive()
    }
}

impl Drop for PackageOperation {
    fn drop(&mut self) {
        self.arguments.zeroize();
    }
}

impl PackageOperation {
    /// Build the operation for a planned package action.
    ///
    /// `package_directory` resolves a package id to its cache directory.
    /// Returns `Ok(None)` for actions that do not run a package.
    pub fn for_action(
        model: &BundleModel,
        variables: &mut Variables,
        package_directory: &dyn Fn(&str) -> PathBuf,
        action: &ExecuteAction,
        rollback: bool,
    ) -> Result<Option<Self>, ApplyError> {
        let (package_id, state) = match (action.package_id(), action.action_state()) {
            (Some(id), Some(state)) => (id, state),
            _ => return Ok(None),
        };

        if let ExecuteAction::RelatedBundle { bundle_id, .. } = action {
            let related = model
                .related_bundles
                .iter()
                .find(|r| &r.bundle_id == bundle_id)
                .ok_or_else(|| ApplyError::UnknownPackage(bundle_id.clone()))?;
            let switch = match state {
                ActionState::Uninstall => "-uninstall",
                ActionState::Repair => "-repair",
                _ => "",
            };
            return Ok(Some(Self {
                package_id: bundle_id.clone(),
                kind: OperationKind::RelatedBundle,
                action: state,
                rollback,
                per_machine: related.per_machine,
                executable: related.cached_path.clone(),
                arguments: switch.to_string(),
                log_arguments: switch.to_string(),
                features: Vec::new(),
                slipstream: Vec::new(),
            }));
        }

        let package = model
            .package(package_id)
            .ok_or_else(|| ApplyError::UnknownPackage(package_id.to_string()))?;
        let directory = package_directory(&package.id);
        let executable = package
            .payloads
            .first()
            .and_then(|key| model.payload(key))
            .map(|payload| directory.join(&payload.file_path));

        let authored = match &package.kind {
            PackageKind::Exe(exe) => authored_arguments(
                state,
                &exe.install_arguments,
                exe.repair_arguments.as_deref(),
                exe.uninstall_arguments.as_deref(),
            ),
            PackageKind::Bundle(bundle) => authored_arguments(
                state,
                &bundle.install_arguments,
                bundle.repair_arguments.as_deref(),
                bundle.uninstall_arguments.as_deref(),
            ),
            _ => None,
        };
        let (arguments, log_arguments) = match authored {
            Some(text) => (
                variables.format(text)?.to_string(),
                variables.format_obfuscated(text)?,
            ),
            None => (String::new(), String::new()),
        };

        let (kind, features, slipstream) = match (&package.kind, action) {
            (PackageKind::Exe(_), _) => (OperationKind::Exe, Vec::new(), Vec::new()),
            (PackageKind::Bundle(_), _) => (OperationKind::Bundle, Vec::new(), Vec::new()),
            (PackageKind::Msu(msu), _) => (
                OperationKind::Msu { kb: msu.kb.clone() },
                Vec::new(),
                Vec::new(),
            ),
            (
                PackageKind::Msp(msp),
                ExecuteAction::MspTarget {
                    target_product_code,
                    ..
                },
            ) => (
                OperationKind::MspTarget {
                    patch_code: msp.patch_code.clone(),
                    target_product_code: target_product_code.clone(),
                },
                Vec::new(),
                Vec::new(),
            ),
            (PackageKind::Msp(msp), _) => (
                OperationKind::MspTarget {
                    patch_code: msp.patch_code.clone(),
                    target_product_code: String::new(),
                },
                Vec::new(),
                Vec::new(),
            ),
            (
                PackageKind::Msi(msi),
                ExecuteAction::MsiPackage {
                    features,
                    slipstream,
                    ..
                },
            ) => {
                let patches = slipstream
                    .iter()
                    .filter_map(|id| model.package(id))
                    .filter_map(|patch| {
                        let key = patch.payloads.first()?;
                        let payload = model.payload(key)?;
                        Some(package_directory(&patch.id).join(&payload.file_path))
                    })
                    .collect();
                (
                    OperationKind::Msi {
                        product_code: msi.product_code.clone(),
                    },
                    features.clone(),
                    patches,
                )
            }
            (PackageKind::Msi(msi), _) => (
                OperationKind::Msi {
                    product_code: msi.product_code.clone(),
                },
                Vec::new(),
                Vec::new(),
            ),
        };

        Ok(Some(Self {
            package_id: package.id.clone(),
            kind,
            action: state,
            rollback,
            per_machine: package.per_machine,
            executable,
            arguments,
            log_arguments,
            features,
            slipstream,
        }))
    }

    /// Operation removing a superseded product.
    pub fn remove_compatible(package_id: &str, product_code: &str, per_machine: bool) -> Self {
        Self {
            package_id: package_id.to_string(),
            kind: OperationKind::Compatible {
                product_code: product_code.to_string(),
            },
            action: ActionState::Uninstall,
            rollback: false,
            per_machine,
            executable: None,
            arguments: String::new(),
            log_arguments: String::new(),
            features: Vec::new(),
            slipstream: Vec::new(),
        }
    }

    /// Error category shown to the user when this operation fails.
    pub fn is_windows_installer(&self) -> bool {
        matches!(
            self.kind,
            OperationKind::Msi { .. }
                | OperationKind::MspTarget { .. }
                | OperationKind::Compatible { .. }
        )
    }
}

fn authored_arguments<'a>(
    state: ActionState,
    install: &'a str,
    repair: Option<&'a str>,
    uninstall: Option<&'a str>,
) -> Option<&'a str> {
    match state {
        ActionState::Uninstall => uninstall,
        ActionState::Repair => repair,
        ActionState::None => None,
        _ => Some(install),
    }
}

/// Callbacks available to an executor while a package runs.
pub trait ExecuteReporter: Send {
    /// Report progress in percent. A cancel result asks the executor to stop.
    fn progress(&mut self, percentage: u32) -> BoxFuture<'_, UiResult>;

    /// Report an error and ask how to proceed. The answer is already
    /// filtered through `allowed`.
    fn error<'a>(
        &'a mut self,
        code: HResult,
        message: &'a str,
        allowed: AllowedResults,
    ) -> BoxFuture<'a, UiResult>;
}

/// Reporter that accepts everything.
#[derive(Debug, Default)]
pub struct SilentReporter;

impl ExecuteReporter for SilentReporter {
    fn progress(&mut self, _percentage: u32) -> BoxFuture<'_, UiResult> {
        Box::pin(async { UiResult::NoAction })
    }

    fn error<'a>(
        &'a mut self,
        _code: HResult,
        _message: &'a str,
        _allowed: AllowedResults,
    ) -> BoxFuture<'a, UiResult> {
        Box::pin(async { UiResult::NoAction })
    }
}

/// Installs, repairs and removes packages.
pub trait PackageExecutor: Send + Sync {
    /// Run one operation. Success carries the restart requirement.
    fn execute<'a>(
        &'a self,
        operation: &'a PackageOperation,
        reporter: &'a mut dyn ExecuteReporter,
    ) -> BoxFuture<'a, Result<Restart, HResult>>;

    /// Whether MSI transactions are real. When false, transacted
    /// boundaries are rolled back package by package.
    fn supports_transactions(&self) -> bool {
        false
    }

    fn begin_transaction<'a>(&'a self, _boundary_id: &'a str) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async { Ok(()) })
    }

    fn commit_transaction<'a>(&'a self, _boundary_id: &'a str) -> BoxFuture<'a, Result<Restart, HResult>> {
        Box::pin(async { Ok(Restart::None) })
    }

    fn rollback_transaction<'a>(&'a self, _boundary_id: &'a str) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async { Err(HResult::E_NOTIMPL) })
    }
}

/// Map a package process exit code to a result.
pub fn exit_code_result(code: i32) -> Result<Restart, HResult> {
    match code {
        0 => Ok(Restart::None),
        3010 => Ok(Restart::Required),
        1641 => Ok(Restart::Initiated),
        1602 => Err(HResult::INSTALL_USEREXIT),
        c if (1..=0xFFFF).contains(&c) => Err(HResult::from_win32(c as u32)),
        c => Err(HResult(c)),
    }
}

/// Split a command line into arguments. Double quotes group words and
/// are removed.
pub fn split_arguments(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;
    for c in line.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}

/// Runs packages through their installers' command lines.
#[derive(Debug, Clone)]
pub struct CommandLineExecutor {
    msiexec: PathBuf,
    wusa: PathBuf,
}

impl Default for CommandLineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandLineExecutor {
    pub fn new() -> Self {
        Self {
            msiexec: PathBuf::from("msiexec"),
            wusa: PathBuf::from("wusa"),
        }
    }

    /// Use different Windows Installer and update tools.
    pub fn with_tools(msiexec: impl Into<PathBuf>, wusa: impl Into<PathBuf>) -> Self {
        Self {
            msiexec: msiexec.into(),
            wusa: wusa.into(),
        }
    }

    /// Program and arguments for an operation.
    pub fn command_line(&self, op: &PackageOperation) -> Result<(PathBuf, Vec<String>), HResult> {
        let executable = || {
            op.executable
                .clone()
                .ok_or(HResult::NOT_FOUND)
                .map(|p| p.to_string_lossy().into_owned())
        };
        let mut args: Vec<String> = Vec::new();
        let program = match &op.kind {
            OperationKind::Exe => {
                args.extend(split_arguments(&op.arguments));
                PathBuf::from(executable()?)
            }
            OperationKind::Bundle | OperationKind::RelatedBundle => {
                args.push("-quiet".into());
                args.extend(split_arguments(&op.arguments));
                PathBuf::from(executable()?)
            }
            OperationKind::Msi { product_code } => {
                match op.action {
                    ActionState::Uninstall => args.extend(["/x".into(), product_code.clone()]),
                    ActionState::Repair => args.extend(["/fvomus".into(), executable()?]),
                    _ => args.extend(["/i".into(), executable()?]),
                }
                args.extend(feature_properties(&op.features));
                if !op.slipstream.is_empty() {
                    let patches: Vec<_> = op
                        .slipstream
                        .iter()
                        .map(|p| p.to_string_lossy().into_owned())
                        .collect();
                    args.push(format!("PATCH={}", patches.join(";")));
                }
                args.extend(["/qn".into(), "REBOOT=ReallySuppress".into()]);
                self.msiexec.clone()
            }
            OperationKind::MspTarget {
                patch_code,
                target_product_code,
            } => {
                if op.action == ActionState::Uninstall {
                    args.extend([
                        "/package".into(),
                        target_product_code.clone(),
                        format!("MSIPATCHREMOVE={patch_code}"),
                    ]);
                } else {
                    args.extend(["/p".into(), executable()?]);
                }
                args.extend(["/qn".into(), "REBOOT=ReallySuppress".into()]);
                self.msiexec.clone()
            }
            OperationKind::Msu { kb } => {
                if op.action == ActionState::Uninstall {
                    args.extend(["/uninstall".into(), format!("/kb:{kb}")]);
                } else {
                    args.push(executable()?);
                }
                args.extend(["/quiet".into(), "/norestart".into()]);
                self.wusa.clone()
            }
            OperationKind::Compatible { product_code } => {
                args.extend([
                    "/x".into(),
                    product_code.clone(),
                    "/qn".into(),
                    "REBOOT=ReallySuppress".into(),
                ]);
                self.msiexec.clone()
            }
        };
        Ok((program, args))
    }
}

fn feature_properties(features: &[FeatureChange]) -> Vec<String> {
    let mut groups: Vec<(&str, Vec<&str>)> = vec![
        ("ADDLOCAL", Vec::new()),
        ("ADDSOURCE", Vec::new()),
        ("ADDDEFAULT", Vec::new()),
        ("REINSTALL", Vec::new()),
        ("ADVERTISE", Vec::new()),
        ("REMOVE", Vec::new()),
    ];
    for feature in features {
        let slot = match feature.action {
            FeatureAction::None => continue,
            FeatureAction::AddLocal => 0,
            FeatureAction::AddSource => 1,
            FeatureAction::AddDefault => 2,
            FeatureAction::Reinstall => 3,
            FeatureAction::Advertise => 4,
            FeatureAction::Remove => 5,
        };
        groups[slot].1.push(&feature.feature_id);
    }
    groups
        .into_iter()
        .filter(|(_, ids)| !ids.is_empty())
        .map(|(name, ids)| format!("{name}={}", ids.join(",")))
        .collect()
}

impl PackageExecutor for CommandLineExecutor {
    fn execute<'a>(
        &'a self,
        operation: &'a PackageOperation,
        reporter: &'a mut dyn ExecuteReporter,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        Box::pin(async move {
            let (program, args) = self.command_line(operation)?;
            if reporter.progress(0).await.is_cancel() && !operation.rollback {
                return Err(HResult::INSTALL_USEREXIT);
            }
            info!(
                package = %operation.package_id,
                action = ?operation.action,
                rollback = operation.rollback,
                program = %program.display(),
                arguments = %operation.log_arguments,
                "Launching package"
            );
            let working_dir = operation
                .executable
                .as_deref()
                .and_then(Path::parent)
                .filter(|p| p.is_dir());

            loop {
                let mut command = Command::new(&program);
                command.args(&args).kill_on_drop(true);
                if let Some(dir) = working_dir {
                    command.current_dir(dir);
                }
                let status = match command.status().await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(package = %operation.package_id, error = %e, "Failed to launch package");
                        let hr = match e.kind() {
                            std::io::ErrorKind::NotFound => HResult::NOT_FOUND,
                            std::io::ErrorKind::PermissionDenied => HResult::E_ACCESSDENIED,
                            _ => HResult::E_FAIL,
                        };
                        return Err(hr);
                    }
                };
                // Terminated by a signal: no exit code to map.
                let code = status.code().unwrap_or(HResult::E_ABORT.0);
                debug!(package = %operation.package_id, code, "Package process exited");
                match exit_code_result(code) {
                    Ok(restart) => {
                        reporter.progress(100).await;
                        return Ok(restart);
                    }
                    Err(hr) if hr == HResult::INSTALL_USEREXIT => return Err(hr),
                    Err(hr) => {
                        let allowed = AllowedResults::RetryCancel;
                        let message = format!("package exited with code {code}");
                        match reporter.error(hr, &message, allowed).await {
                            UiResult::Retry => {
                                info!(package = %operation.package_id, "Retrying package");
                                continue;
                            }
                            _ => return Err(hr),
                        }
                    }
                }
            }
        })
    }
}
