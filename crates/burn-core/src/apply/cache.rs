//! Package cache.
//!
//! Payloads are first staged into a working directory (copied from the
//! bundle source or extracted from a container), then verified and moved
//! into a per-package directory. Layout copies verified payloads into a
//! caller-chosen directory instead.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::hresult::HResult;
use crate::model::{Container, Payload, Verification};
use crate::model::payload::ContainerBusy;

/// Name of the staging directory under the cache root.
const WORKING_DIR: &str = ".working";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("source for '{key}' not found at {path}")]
    MissingSource { key: String, path: PathBuf },

    #[error("hash mismatch for '{key}': expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for '{key}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("container '{0}' is not a staged directory")]
    UnsupportedContainer(String),

    #[error("payload '{0}' was never acquired")]
    NotAcquired(String),

    #[error(transparent)]
    Busy(#[from] ContainerBusy),

    #[error("elevated cache operation failed: {0}")]
    Remote(HResult),
}

impl CacheError {
    pub fn hresult(&self) -> HResult {
        match self {
            CacheError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => HResult::NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => HResult::E_ACCESSDENIED,
                _ => HResult::E_FAIL,
            },
            CacheError::MissingSource { .. } | CacheError::NotAcquired(_) => HResult::NOT_FOUND,
            CacheError::HashMismatch { .. } | CacheError::SizeMismatch { .. } => {
                HResult::INVALID_DATA
            }
            CacheError::UnsupportedContainer(_) => HResult::E_NOTIMPL,
            CacheError::Busy(_) => HResult::BUSY,
            CacheError::Remote(hr) => *hr,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Acquires, verifies and stores payloads.
pub trait CacheProvider: Send + Sync {
    /// Directory holding a package's cached payloads.
    fn package_directory(&self, package_id: &str) -> PathBuf;

    /// Bring a detached container next to the working directory.
    fn acquire_container<'a>(
        &'a self,
        container: &'a Container,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Stage the named payloads out of a container.
    fn extract_container<'a>(
        &'a self,
        container: &'a Container,
        source_directory: &'a Path,
        payloads: &'a [&'a Payload],
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Stage a loose payload.
    fn acquire_payload<'a>(
        &'a self,
        payload: &'a Payload,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Verify a staged payload and move it into the package directory.
    fn cache_payload<'a>(
        &'a self,
        package_id: &'a str,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Verify a staged payload and copy it into `directory`.
    fn layout_payload<'a>(
        &'a self,
        payload: &'a Payload,
        directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Copy the bundle itself into `directory`.
    fn layout_bundle<'a>(&'a self, directory: &'a Path) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Remove everything cached for a package. Missing is not an error.
    fn remove_package<'a>(&'a self, package_id: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Hex SHA-256 of a file.
pub async fn sha256_file(path: &Path) -> Result<String, CacheError> {
    let mut file = tokio::fs::File::open(path).await.map_err(io_error(path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await.map_err(io_error(path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check a file against the payload's size and verification.
pub async fn verify_payload(payload: &Payload, path: &Path) -> Result<(), CacheError> {
    let metadata = tokio::fs::metadata(path).await.map_err(io_error(path))?;
    if payload.size != 0 && metadata.len() != payload.size {
        return Err(CacheError::SizeMismatch {
            key: payload.key.clone(),
            expected: payload.size,
            actual: metadata.len(),
        });
    }
    match &payload.verification {
        Verification::Hash { sha256 } => {
            let actual = sha256_file(path).await?;
            if !actual.eq_ignore_ascii_case(sha256) {
                return Err(CacheError::HashMismatch {
                    key: payload.key.clone(),
                    expected: sha256.clone(),
                    actual,
                });
            }
        }
        // Signature checks belong to the platform trust provider.
        Verification::Authenticode { .. } | Verification::None => {}
    }
    Ok(())
}

/// File-system cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
    bundle_path: Option<PathBuf>,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bundle_path: None,
        }
    }

    /// Executable copied by [`CacheProvider::layout_bundle`].
    pub fn with_bundle_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bundle_path = Some(path.into());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn working_path(&self, key: &str) -> PathBuf {
        self.root.join(WORKING_DIR).join(sanitize(key))
    }

    fn container_path(&self, id: &str) -> PathBuf {
        self.root.join(WORKING_DIR).join("containers").join(sanitize(id))
    }

    async fn stage(&self, key: &str, source: &Path) -> Result<(), CacheError> {
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(CacheError::MissingSource {
                key: key.to_string(),
                path: source.to_path_buf(),
            });
        }
        let target = self.working_path(key);
        ensure_parent(&target).await?;
        tokio::fs::copy(source, &target)
            .await
            .map_err(io_error(&target))?;
        debug!(payload = %key, source = %source.display(), "Staged payload");
        Ok(())
    }
}

/// Keep a key usable as a single path component.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

async fn ensure_parent(path: &Path) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }
    Ok(())
}

/// Where a payload or container is read from.
fn source_path(source_directory: &Path, file_path: &Path, download: Option<&str>) -> PathBuf {
    let local = source_directory.join(file_path);
    match download.and_then(|url| url.strip_prefix("file://")) {
        Some(remote) if !local.exists() => PathBuf::from(remote),
        _ => local,
    }
}

async fn copy_dir(source: &Path, target: &Path) -> Result<(), CacheError> {
    tokio::fs::create_dir_all(target)
        .await
        .map_err(io_error(target))?;
    let mut pending = vec![(source.to_path_buf(), target.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&from).await.map_err(io_error(&from))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&from))? {
            let src = entry.path();
            let dst = to.join(entry.file_name());
            let kind = entry.file_type().await.map_err(io_error(&src))?;
            if kind.is_dir() {
                tokio::fs::create_dir_all(&dst).await.map_err(io_error(&dst))?;
                pending.push((src, dst));
            } else {
                tokio::fs::copy(&src, &dst).await.map_err(io_error(&dst))?;
            }
        }
    }
    Ok(())
}

impl CacheProvider for FileCache {
    fn package_directory(&self, package_id: &str) -> PathBuf {
        self.root.join(sanitize(package_id))
    }

    fn acquire_container<'a>(
        &'a self,
        container: &'a Container,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let file_path = container
                .file_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(&container.id));
            let source = source_path(
                source_directory,
                &file_path,
                container.download.as_ref().map(|d| d.url.as_str()),
            );
            let is_dir = tokio::fs::metadata(&source)
                .await
                .map(|m| m.is_dir())
                .map_err(|_| CacheError::MissingSource {
                    key: container.id.clone(),
                    path: source.clone(),
                })?;
            if !is_dir {
                return Err(CacheError::UnsupportedContainer(container.id.clone()));
            }
            let target = self.container_path(&container.id);
            copy_dir(&source, &target).await?;
            info!(container = %container.id, "Acquired container");
            Ok(())
        })
    }

    fn extract_container<'a>(
        &'a self,
        container: &'a Container,
        source_directory: &'a Path,
        payloads: &'a [&'a Payload],
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let _stream = container.open_stream()?;
            let acquired = self.container_path(&container.id);
            let staged = if tokio::fs::try_exists(&acquired).await.unwrap_or(false) {
                acquired
            } else {
                // Attached containers are staged next to the bundle.
                source_directory.join(&container.id)
            };
            if !tokio::fs::metadata(&staged)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                return Err(CacheError::UnsupportedContainer(container.id.clone()));
            }
            for payload in payloads {
                self.stage(&payload.key, &staged.join(&payload.file_path))
                    .await?;
            }
            debug!(
                container = %container.id,
                payloads = payloads.len(),
                "Extracted container"
            );
            Ok(())
        })
    }

    fn acquire_payload<'a>(
        &'a self,
        payload: &'a Payload,
        source_directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let source = source_path(
                source_directory,
                &payload.file_path,
                payload.download.as_ref().map(|d| d.url.as_str()),
            );
            self.stage(&payload.key, &source).await
        })
    }

    fn cache_payload<'a>(
        &'a self,
        package_id: &'a str,
        payload: &'a Payload,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let target = self.package_directory(package_id).join(&payload.file_path);
            let staged = self.working_path(&payload.key);
            if !tokio::fs::try_exists(&staged).await.unwrap_or(false) {
                // Already cached by an earlier run.
                if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    return verify_payload(payload, &target).await;
                }
                return Err(CacheError::NotAcquired(payload.key.clone()));
            }
            if let Err(e) = verify_payload(payload, &staged).await {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(e);
            }
            ensure_parent(&target).await?;
            if tokio::fs::rename(&staged, &target).await.is_err() {
                tokio::fs::copy(&staged, &target)
                    .await
                    .map_err(io_error(&target))?;
                let _ = tokio::fs::remove_file(&staged).await;
            }
            debug!(package = %package_id, payload = %payload.key, "Cached payload");
            Ok(())
        })
    }

    fn layout_payload<'a>(
        &'a self,
        payload: &'a Payload,
        directory: &'a Path,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let staged = self.working_path(&payload.key);
            verify_payload(payload, &staged).await?;
            let target = directory.join(&payload.file_path);
            ensure_parent(&target).await?;
            tokio::fs::copy(&staged, &target)
                .await
                .map_err(io_error(&target))?;
            debug!(payload = %payload.key, target = %target.display(), "Laid out payload");
            Ok(())
        })
    }

    fn layout_bundle<'a>(&'a self, directory: &'a Path) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(directory)
                .await
                .map_err(io_error(directory))?;
            if let Some(bundle) = &self.bundle_path
                && let Some(name) = bundle.file_name()
            {
                let target = directory.join(name);
                tokio::fs::copy(bundle, &target)
                    .await
                    .map_err(io_error(&target))?;
            }
            Ok(())
        })
    }

    fn remove_package<'a>(&'a self, package_id: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let directory = self.package_directory(package_id);
            match tokio::fs::remove_dir_all(&directory).await {
                Ok(()) => {
                    info!(package = %package_id, "Removed package from cache");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    warn!(package = %package_id, error = %e, "Failed to remove cached package");
                    Err(io_error(&directory)(e))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Packaging;
    use tempfile::TempDir;

    fn payload(key: &str, contents: &[u8], verify: bool) -> Payload {
        let verification = if verify {
            Verification::Hash {
                sha256: hex::encode(Sha256::digest(contents)),
            }
        } else {
            Verification::None
        };
        Payload {
            key: key.into(),
            file_path: PathBuf::from(key),
            packaging: Packaging::External,
            container: None,
            verification,
            size: contents.len() as u64,
            download: None,
            layout_only: false,
            ux: false,
        }
    }

    #[tokio::test]
    async fn test_acquire_verify_and_cache() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        tokio::fs::write(source.path().join("setup.exe"), b"binary")
            .await
            .unwrap();
        let p = payload("setup.exe", b"binary", true);
        let cache = FileCache::new(root.path());

        cache.acquire_payload(&p, source.path()).await.unwrap();
        cache.cache_payload("Tool", &p).await.unwrap();

        let cached = cache.package_directory("Tool").join("setup.exe");
        assert_eq!(tokio::fs::read(&cached).await.unwrap(), b"binary");
        // A second run finds it already cached.
        cache.cache_payload("Tool", &p).await.unwrap();

        cache.remove_package("Tool").await.unwrap();
        assert!(!cached.exists());
        cache.remove_package("Tool").await.unwrap();
    }

    #[tokio::test]
    async fn test_hash_mismatch_is_rejected() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        tokio::fs::write(source.path().join("setup.exe"), b"tampered")
            .await
            .unwrap();
        let mut p = payload("setup.exe", b"original", true);
        p.size = 0;
        let cache = FileCache::new(root.path());
        cache.acquire_payload(&p, source.path()).await.unwrap();
        let err = cache.cache_payload("Tool", &p).await.unwrap_err();
        assert!(matches!(err, CacheError::HashMismatch { .. }));
        assert_eq!(err.hresult(), HResult::INVALID_DATA);
    }

    #[tokio::test]
    async fn test_missing_source() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let p = payload("nope.exe", b"", false);
        let err = FileCache::new(root.path())
            .acquire_payload(&p, source.path())
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HResult::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_staged_container_extracts_and_lays_out() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let layout = TempDir::new().unwrap();
        let staged = source.path().join("cab1");
        tokio::fs::create_dir_all(&staged).await.unwrap();
        tokio::fs::write(staged.join("a.msi"), b"aaa").await.unwrap();

        let container = Container::new("cab1");
        let a = payload("a.msi", b"aaa", true);
        let cache = FileCache::new(root.path());
        cache
            .acquire_container(&container, source.path())
            .await
            .unwrap();
        cache
            .extract_container(&container, source.path(), &[&a])
            .await
            .unwrap();
        cache.layout_payload(&a, layout.path()).await.unwrap();
        assert!(layout.path().join("a.msi").exists());
    }

    #[tokio::test]
    async fn test_file_container_is_unsupported() {
        let source = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        tokio::fs::write(source.path().join("cab1"), b"MSCF").await.unwrap();
        let container = Container::new("cab1");
        let err = FileCache::new(root.path())
            .acquire_container(&container, source.path())
            .await
            .unwrap_err();
        assert_eq!(err.hresult(), HResult::E_NOTIMPL);
    }
}
