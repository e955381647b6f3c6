//! Related bundles and update feed entries.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::state::{ActionState, RelatedOperation, RelationType, RequestState};
use crate::version::Version;

/// Codes this bundle uses to find related bundles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelatedCodes {
    #[serde(default)]
    pub upgrade: Vec<String>,
    #[serde(default)]
    pub addon: Vec<String>,
    #[serde(default)]
    pub patch: Vec<String>,
    #[serde(default)]
    pub detect: Vec<String>,
}

/// A registered bundle found on the machine during Detect.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedBundle {
    pub bundle_id: String,
    pub relation: RelationType,
    pub version: Version,
    pub per_machine: bool,
    pub tag: Option<String>,
    pub provider_key: Option<String>,
    /// Cached executable used to run the related bundle.
    pub cached_path: Option<PathBuf>,

    pub operation: RelatedOperation,
    pub default_requested: RequestState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
}

/// Update feed configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFeed {
    #[serde(default)]
    pub source: Option<String>,
}

/// One entry read from the update feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub source: String,
    pub version: Version,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}
