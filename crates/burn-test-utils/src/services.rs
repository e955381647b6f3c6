//! Recording stand-ins for the engine's package, cache and registration
//! capabilities.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use burn_core::BoxFuture;
use burn_core::apply::{
    CacheError, CacheProvider, ExecuteReporter, PackageExecutor, PackageOperation, Registrar,
    RegistrationOp,
};
use burn_core::ba::UiResult;
use burn_core::hresult::HResult;
use burn_core::model::{ActionState, Container, Payload, Restart};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One call to [`ScriptedExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedOp {
    pub package_id: String,
    pub action: ActionState,
    pub rollback: bool,
}

/// Succeeds unless scripted otherwise, recording every operation.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    runs: Mutex<Vec<ExecutedOp>>,
    /// Package id to (failure, remaining failures). Forward operations only.
    failures: Mutex<HashMap<String, (HResult, u32)>>,
    restarts: HashMap<String, Restart>,
    transactions: bool,
    transaction_log: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `package_id` going forward the next `times` attempts.
    pub fn fail(self, package_id: &str, hr: HResult, times: u32) -> Self {
        lock(&self.failures).insert(package_id.to_string(), (hr, times));
        self
    }

    /// Fail `package_id` going forward every time.
    pub fn always_fail(self, package_id: &str, hr: HResult) -> Self {
        self.fail(package_id, hr, u32::MAX)
    }

    pub fn restart(mut self, package_id: &str, restart: Restart) -> Self {
        self.restarts.insert(package_id.to_string(), restart);
        self
    }

    /// Claim MSI transaction support and record transaction calls.
    pub fn with_transactions(mut self) -> Self {
        self.transactions = true;
        self
    }

    pub fn runs(&self) -> Vec<ExecutedOp> {
        lock(&self.runs).clone()
    }

    /// Package ids in execution order, suffixed with `(rollback)` for
    /// rollback operations.
    pub fn trace(&self) -> Vec<String> {
        self.runs()
            .into_iter()
            .map(|op| {
                if op.rollback {
                    format!("{} (rollback)", op.package_id)
                } else {
                    op.package_id
                }
            })
            .collect()
    }

    pub fn rolled_back(&self) -> Vec<String> {
        self.runs()
            .into_iter()
            .filter(|op| op.rollback)
            .map(|op| op.package_id)
            .collect()
    }

    /// `begin <id>`, `commit <id>` and `rollback <id>` entries.
    pub fn transaction_log(&self) -> Vec<String> {
        lock(&self.transaction_log).clone()
    }

    fn scripted_failure(&self, operation: &PackageOperation) -> Option<HResult> {
        if operation.rollback {
            return None;
        }
        let mut failures = lock(&self.failures);
        let (hr, left) = failures.get_mut(&operation.package_id)?;
        if *left == 0 {
            return None;
        }
        *left -= 1;
        Some(*hr)
    }
}

impl PackageExecutor for ScriptedExecutor {
    fn execute<'a>(
        &'a self,
        operation: &'a PackageOperation,
        reporter: &'a mut dyn ExecuteReporter,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        Box::pin(async move {
            lock(&self.runs).push(ExecutedOp {
                package_id: operation.package_id.clone(),
                action: operation.action,
                rollback: operation.rollback,
            });
            if reporter.progress(50).await == UiResult::Cancel {
                return Err(HResult::INSTALL_USEREXIT);
            }
            if let Some(hr) = self.scripted_failure(operation) {
                return Err(hr);
            }
            Ok(self
                .restarts
                .get(&operation.package_id)
                .copied()
                .unwrap_or_default())
        })
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    fn begin_transaction<'a>(&'a self, boundary_id: &'a str) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            lock(&self.transaction_log).push(format!("begin {boundary_id}"));
            Ok(())
        })
    }

    fn commit_transaction<'a>(
        &'a self,
        boundary_id: &'a str,
    ) -> BoxFuture<'a, Result<Restart, HResult>> {
        Box::pin(async move {
            lock(&self.transaction_log).push(format!("commit {boundary_id}"));
            Ok(Restart::None)
        })
    }

    fn rollback_transaction<'a>(
        &'a self,
        boundary_id: &'a str,
    ) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            if !self.transactions {
                return Err(HResult::E_NOTIMPL);
            }
            lock(&self.transaction_log).push(format!("rollback {boundary_id}"));
            Ok(())
        })
    }
}

/// A cache that moves no bytes. Records what was cached, laid out and
/// removed; payloads named with [`MemoryCache::missing`] fail to acquire.
#[derive(Debug)]
pub struct MemoryCache {
    root: PathBuf,
    missing: HashSet<String>,
    cached: Mutex<Vec<(String, String)>>,
    laid_out: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new("/memory-cache")
    }
}

impl MemoryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            missing: HashSet::new(),
            cached: Mutex::default(),
            laid_out: Mutex::default(),
            removed: Mutex::default(),
        }
    }

    pub fn missing(mut self, payload_key: &str) -> Self {
        self.missing.insert(payload_key.to_string());
        self
    }

    /// Package ids that cached at least one payload, in first-cached order.
    pub fn cached_packages(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for (package_id, _) in lock(&self.cached).iter() {
            if !seen.contains(package_id) {
                seen.push(package_id.clone());
            }
        }
        seen
    }

    pub fn laid_out(&self) -> Vec<String> {
        lock(&self.laid_out).clone()
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.removed).clone()
    }
}

impl CacheProvider for MemoryCache {
    fn package_directory(&self, package_id: &str) -> PathBuf {
        self.root.join(package_id)
    }

    fn acquire_container<'a>(
        &'a self,
        _container: &'a Container,
        _source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async { Ok(()) })
    }

    fn extract_container<'a>(
        &'a self,
        _container: &'a Container,
        _source_directory: &'a Path,
        _payloads: &'a [&'a Payload],
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async { Ok(()) })
    }

    fn acquire_payload<'a>(
        &'a self,
        payload: &'a Payload,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            if self.missing.contains(&payload.key) {
                return Err(CacheError::MissingSource {
                    key: payload.key.clone(),
                    path: source_directory.join(&payload.file_path),
                });
            }
            Ok(())
        })
    }

    fn cache_payload<'a>(
        &'a self,
        package_id: &'a str,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            lock(&self.cached).push((package_id.to_string(), payload.key.clone()));
            Ok(())
        })
    }

    fn layout_payload<'a>(
        &'a self,
        payload: &'a Payload,
        _directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            lock(&self.laid_out).push(payload.key.clone());
            Ok(())
        })
    }

    fn layout_bundle<'a>(&'a self, _directory: &'a Path) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            lock(&self.laid_out).push("<bundle>".to_string());
            Ok(())
        })
    }

    fn remove_package<'a>(&'a self, package_id: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            lock(&self.removed).push(package_id.to_string());
            Ok(())
        })
    }
}

/// Records registration operations.
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    ops: Mutex<Vec<RegistrationOp>>,
}

impl RecordingRegistrar {
    pub fn ops(&self) -> Vec<RegistrationOp> {
        lock(&self.ops).clone()
    }
}

impl Registrar for RecordingRegistrar {
    fn apply<'a>(&'a self, op: &'a RegistrationOp) -> BoxFuture<'a, Result<(), HResult>> {
        Box::pin(async move {
            lock(&self.ops).push(op.clone());
            Ok(())
        })
    }
}
