//! Containers and payloads.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

/// Where a download comes from. The password is never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadSource {
    pub url: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for DownloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadSource")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Container storage format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ContainerKind {
    Cabinet,
    /// Format handled by a bundle extension.
    Extension { extension_id: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerVerification {
    /// Lower-case hex SHA-256 of the container file.
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size: u64,
}

/// A container holding one or more payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    #[serde(flatten)]
    pub kind: ContainerKind,

    /// Whether authoring attached this container to the bundle executable.
    #[serde(default)]
    pub attached: bool,
    /// Index into the executable's attached-container table.
    #[serde(default)]
    pub attached_index: u32,

    /// File name relative to the bundle's source directory.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    #[serde(default)]
    pub download: Option<DownloadSource>,
    #[serde(default)]
    pub verification: ContainerVerification,

    /// Offset and size inside the running executable, resolved at runtime.
    #[serde(skip)]
    pub offset: u64,
    #[serde(skip)]
    pub size: u64,
    /// False when authored as attached but missing from the executable.
    #[serde(skip)]
    pub actually_attached: bool,
    #[serde(skip)]
    stream_open: Arc<AtomicBool>,
}

/// Offsets of containers attached to the running executable, indexed by
/// attached index.
#[derive(Debug, Clone, Default)]
pub struct AttachedSection {
    pub containers: Vec<(u64, u64)>,
}

/// Errors opening a container stream.
#[derive(Debug, thiserror::Error)]
#[error("container '{0}' already has an open stream")]
pub struct ContainerBusy(pub String);

impl Container {
    /// A detached cabinet read from `id` in the source directory.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: ContainerKind::Cabinet,
            attached: false,
            attached_index: 0,
            file_path: None,
            download: None,
            verification: ContainerVerification::default(),
            offset: 0,
            size: 0,
            actually_attached: false,
            stream_open: Arc::default(),
        }
    }

    /// Resolve attached offset and size against the executable's section.
    pub fn resolve_attached(&mut self, section: &AttachedSection) {
        if !self.attached {
            self.actually_attached = false;
            return;
        }
        match section.containers.get(self.attached_index as usize) {
            Some(&(offset, size)) => {
                self.offset = offset;
                self.size = size;
                self.actually_attached = true;
            }
            None => {
                // Expected when the bundle was split from its containers.
                tracing::debug!(container = %self.id, "Attached container not present");
                self.actually_attached = false;
            }
        }
    }

    /// Claim the container's single stream context.
    pub fn open_stream(&self) -> Result<ContainerStream, ContainerBusy> {
        if self.stream_open.swap(true, Ordering::AcqRel) {
            return Err(ContainerBusy(self.id.clone()));
        }
        Ok(ContainerStream {
            flag: Arc::clone(&self.stream_open),
        })
    }
}

/// Held while a container is being read. Dropping it releases the stream.
#[derive(Debug)]
pub struct ContainerStream {
    flag: Arc<AtomicBool>,
}

impl Drop for ContainerStream {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packaging {
    #[default]
    Embedded,
    External,
}

/// How a payload's bytes are verified before use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Verification {
    #[default]
    None,
    Hash { sha256: String },
    /// Signed file; `thumbprint` pins the signing certificate.
    Authenticode { thumbprint: String },
}

/// A file delivered by the bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub key: String,
    pub file_path: PathBuf,
    #[serde(default)]
    pub packaging: Packaging,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub download: Option<DownloadSource>,
    /// Only needed when laying out the bundle.
    #[serde(default)]
    pub layout_only: bool,
    /// Belongs to the bootstrapper application.
    #[serde(default)]
    pub ux: bool,
}

impl Payload {
    pub fn sha256(&self) -> Option<&str> {
        match &self.verification {
            Verification::Hash { sha256 } => Some(sha256),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(attached: bool, index: u32) -> Container {
        Container {
            id: "c1".into(),
            kind: ContainerKind::Cabinet,
            attached,
            attached_index: index,
            file_path: None,
            download: None,
            verification: ContainerVerification::default(),
            offset: 0,
            size: 0,
            actually_attached: false,
            stream_open: Arc::default(),
        }
    }

    #[test]
    fn test_resolve_attached() {
        let section = AttachedSection {
            containers: vec![(4096, 100)],
        };
        let mut c = container(true, 0);
        c.resolve_attached(&section);
        assert!(c.actually_attached);
        assert_eq!((c.offset, c.size), (4096, 100));

        let mut missing = container(true, 3);
        missing.resolve_attached(&section);
        assert!(!missing.actually_attached);
    }

    #[test]
    fn test_single_stream_per_container() {
        let c = container(false, 0);
        let stream = c.open_stream().unwrap();
        assert!(c.open_stream().is_err());
        drop(stream);
        assert!(c.open_stream().is_ok());
    }

    #[test]
    fn test_download_source_redacts_password() {
        let source = DownloadSource {
            url: "https://example.test/a.cab".into(),
            user: Some("u".into()),
            password: Some("pw".into()),
        };
        assert!(!format!("{source:?}").contains("pw\""));
    }
}
