//! Launching allow-listed executables on behalf of the application.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::executor::split_arguments;
use crate::hresult::HResult;
use crate::model::BundleModel;
use crate::variables::{VariableError, Variables};

#[derive(Debug, thiserror::Error)]
pub enum ApprovedExeError {
    #[error("unknown approved exe '{0}'")]
    Unknown(String),

    #[error("'{0}' is not under a trusted location")]
    Insecure(PathBuf),

    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Variable(#[from] VariableError),
}

impl ApprovedExeError {
    pub fn hresult(&self) -> HResult {
        match self {
            ApprovedExeError::Unknown(_) => HResult::NOT_FOUND,
            ApprovedExeError::Insecure(_) => HResult::E_ACCESSDENIED,
            ApprovedExeError::Launch { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => HResult::NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => HResult::E_ACCESSDENIED,
                _ => HResult::E_FAIL,
            },
            ApprovedExeError::Variable(_) => HResult::E_INVALIDARG,
        }
    }
}

/// A resolved launch request. Sent to the companion when elevated.
#[derive(Clone, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub id: String,
    pub executable: PathBuf,
    /// Formatted arguments. May contain secrets.
    pub arguments: String,
    /// Arguments with hidden variables masked.
    pub log_arguments: String,
    /// How long to wait for the process to settle. Informational only.
    pub wait: Duration,
}

impl std::fmt::Debug for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchCommand")
            .field("id", &self.id)
            .field("executable", &self.executable)
            .field("arguments", &self.log_arguments)
            .field("wait", &self.wait)
            .finish()
    }
}

impl Drop for LaunchCommand {
    fn drop(&mut self) {
        self.arguments.zeroize();
    }
}

/// Resolve an approved exe and the application's extra arguments.
///
/// The formatted pass produces what is run; the obfuscated pass produces
/// what may be logged.
pub fn prepare_launch(
    model: &BundleModel,
    variables: &mut Variables,
    id: &str,
    extra_arguments: Option<&str>,
    wait: Duration,
) -> Result<LaunchCommand, ApprovedExeError> {
    let exe = model
        .approved_exe(id)
        .ok_or_else(|| ApprovedExeError::Unknown(id.to_string()))?;
    let executable = PathBuf::from(variables.format(&exe.path)?.as_str());

    let mut arguments = String::new();
    let mut log_arguments = String::new();
    if let Some(authored) = &exe.arguments {
        arguments.push_str(&variables.format(authored)?);
        log_arguments.push_str(&variables.format_obfuscated(authored)?);
    }
    if let Some(extra) = extra_arguments.filter(|a| !a.is_empty()) {
        if !arguments.is_empty() {
            arguments.push(' ');
            log_arguments.push(' ');
        }
        arguments.push_str(&variables.format(extra)?);
        log_arguments.push_str(&variables.format_obfuscated(extra)?);
    }

    Ok(LaunchCommand {
        id: id.to_string(),
        executable,
        arguments,
        log_arguments,
        wait,
    })
}

/// Collapse `.` and `..` without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

const PATHS_IGNORE_CASE: bool = cfg!(windows);

fn fold_case(path: &Path) -> PathBuf {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect()
}

/// Whether `candidate` is inside `root` and is not `root` itself.
fn is_strictly_under(candidate: &Path, root: &Path, ignore_case: bool) -> bool {
    if ignore_case {
        let (candidate, root) = (fold_case(candidate), fold_case(root));
        candidate.starts_with(&root) && candidate != root
    } else {
        candidate.starts_with(root) && candidate != root
    }
}

fn is_rundll32(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.eq_ignore_ascii_case("rundll32.exe") || n == "rundll32")
}

/// Check that `path` lives under one of `trusted` roots.
///
/// `rundll32` loads whatever its first argument names, so for it the DLL
/// path (up to the comma before the entry point) is checked instead.
pub fn verify_secure_location(
    path: &Path,
    arguments: &str,
    trusted: &[PathBuf],
) -> Result<(), ApprovedExeError> {
    if is_rundll32(path) {
        let target = split_arguments(arguments)
            .into_iter()
            .next()
            .map(|first| match first.split_once(',') {
                Some((dll, _)) => dll.to_string(),
                None => first,
            })
            .ok_or_else(|| ApprovedExeError::Insecure(path.to_path_buf()))?;
        return verify_secure_location(Path::new(&target), "", trusted);
    }

    let candidate = normalize(path);
    if !candidate.is_absolute() {
        return Err(ApprovedExeError::Insecure(path.to_path_buf()));
    }
    let secure = trusted
        .iter()
        .any(|root| is_strictly_under(&candidate, &normalize(root), PATHS_IGNORE_CASE));
    if secure {
        debug!(path = %candidate.display(), "Path is under a trusted location");
        Ok(())
    } else {
        Err(ApprovedExeError::Insecure(path.to_path_buf()))
    }
}

/// Launch the command in its own process group. Returns the process id.
pub async fn launch(command: &LaunchCommand) -> Result<u32, ApprovedExeError> {
    info!(
        id = %command.id,
        path = %command.executable.display(),
        arguments = %command.log_arguments,
        "Launching approved exe"
    );
    let mut process = Command::new(&command.executable);
    process.args(split_arguments(&command.arguments));
    #[cfg(unix)]
    process.process_group(0);
    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        process.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let mut child = process.spawn().map_err(|source| ApprovedExeError::Launch {
        path: command.executable.clone(),
        source,
    })?;
    let pid = child.id().unwrap_or_default();

    if !command.wait.is_zero() {
        match tokio::time::timeout(command.wait, child.wait()).await {
            Ok(Ok(status)) => debug!(id = %command.id, ?status, "Approved exe exited during wait"),
            Ok(Err(e)) => warn!(id = %command.id, error = %e, "Wait on approved exe failed"),
            Err(_) => debug!(id = %command.id, "Approved exe still running after wait"),
        }
    }
    // Dropping the handle leaves the process running.
    drop(child);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Variant;

    const MANIFEST: &str = r#"
        [bundle]
        id = "{B0B0}"
        name = "Sample"
        version = "1.0"
        provider_key = "sample"

        [[approved_exes]]
        id = "Configure"
        path = "[ToolDir]/configure"
        arguments = "--token [Token]"
    "#;

    fn trusted() -> Vec<PathBuf> {
        vec![PathBuf::from("/opt/programs"), PathBuf::from("/var/cache/burn")]
    }

    #[test]
    fn test_prepare_launch_masks_secrets() {
        let model = BundleModel::from_toml(MANIFEST).unwrap();
        let mut vars = Variables::new();
        vars.set_string("ToolDir", "/opt/programs/sample").unwrap();
        vars.declare("Token", Variant::string("hunter2"), true, false)
            .unwrap();
        let command = prepare_launch(
            &model,
            &mut vars,
            "Configure",
            Some("--quiet"),
            Duration::ZERO,
        )
        .unwrap();
        assert_eq!(
            command.executable,
            PathBuf::from("/opt/programs/sample/configure")
        );
        assert_eq!(command.arguments, "--token hunter2 --quiet");
        assert!(!command.log_arguments.contains("hunter2"));
        assert!(command.log_arguments.ends_with("--quiet"));
        assert!(!format!("{command:?}").contains("hunter2"));
    }

    #[test]
    fn test_unknown_exe() {
        let model = BundleModel::from_toml(MANIFEST).unwrap();
        let err = prepare_launch(&model, &mut Variables::new(), "Nope", None, Duration::ZERO)
            .unwrap_err();
        assert_eq!(err.hresult(), HResult::NOT_FOUND);
    }

    #[test]
    fn test_secure_location() {
        let roots = trusted();
        assert!(verify_secure_location(Path::new("/opt/programs/a/b"), "", &roots).is_ok());
        assert!(verify_secure_location(Path::new("/tmp/evil"), "", &roots).is_err());
        assert!(
            verify_secure_location(Path::new("/opt/programs/../../tmp/evil"), "", &roots)
                .is_err()
        );
        assert!(verify_secure_location(Path::new("relative/tool"), "", &roots).is_err());
        assert!(verify_secure_location(Path::new("/opt/programs"), "", &roots).is_err());
    }

    #[test]
    fn test_trusted_roots_compare_without_case_when_asked() {
        let root = Path::new("/Program Files/Vendor");
        let exe = Path::new("/program files/VENDOR/bin/tool.exe");
        assert!(is_strictly_under(exe, root, true));
        assert!(!is_strictly_under(exe, root, false));
        assert!(!is_strictly_under(Path::new("/PROGRAM FILES/vendor"), root, true));
        assert!(!is_strictly_under(Path::new("/program files/vendorx/a"), root, true));
    }

    #[test]
    fn test_rundll32_checks_its_target() {
        let roots = trusted();
        let loader = Path::new("/windows/system32/rundll32.exe");
        assert!(
            verify_secure_location(loader, "/var/cache/burn/pkg/helper.dll,Entry", &roots).is_ok()
        );
        assert!(verify_secure_location(loader, "/tmp/evil.dll,Entry", &roots).is_err());
        assert!(verify_secure_location(loader, "", &roots).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_returns_pid() {
        let command = LaunchCommand {
            id: "t".into(),
            executable: PathBuf::from("true"),
            arguments: String::new(),
            log_arguments: String::new(),
            wait: Duration::from_secs(5),
        };
        assert!(launch(&command).await.unwrap() > 0);
    }
}
