//! Plan engine.
//!
//! A [`Plan`] is built from the detected model and the requested bundle
//! action. It holds paired lists: execute and rollback, cache and rollback
//! cache, registration and rollback registration, plus clean actions run
//! after a successful apply.
//!
//! ## Checkpoints
//!
//! Each package's rollback actions are appended *before* a checkpoint that
//! is written to both the execute and rollback lists with the same id. When
//! an execute action fails after checkpoint `N`, rollback starts at
//! checkpoint `N` in the rollback list and walks backward, stopping at the
//! start of the active rollback boundary.

pub mod action;
pub mod builder;
pub mod request;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Serialize;

pub use action::{
    CacheAction, CacheStatus, CacheSyncPoint, CleanAction, ExecuteAction, FeatureChange, Planned,
    RegistrationAction,
};
pub use builder::{PlanRequest, plan};

use crate::hresult::HResult;
use crate::model::{BundleAction, RollbackBoundary};
use crate::variables::VariableError;

/// Errors from building a plan. No partial plan is returned with any of them.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("planning cancelled by the bootstrapper application")]
    UserExit,

    #[error("unknown {what} '{id}'")]
    UnknownReference { what: &'static str, id: String },

    #[error("layout requested without a layout directory")]
    MissingLayoutDirectory,

    #[error(transparent)]
    Variable(#[from] VariableError),
}

impl PlanError {
    pub fn hresult(&self) -> HResult {
        match self {
            PlanError::UserExit => HResult::INSTALL_USEREXIT,
            PlanError::UnknownReference { .. } => HResult::NOT_FOUND,
            PlanError::MissingLayoutDirectory => HResult::E_INVALIDARG,
            PlanError::Variable(_) => HResult::E_FAIL,
        }
    }
}

/// Informational totals for progress reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanTotals {
    /// Packages and related bundles executed going forward.
    pub package_count: usize,
    pub cache_package_count: usize,
    pub cache_size: u64,
    pub install_size: u64,
}

impl PlanTotals {
    /// Progress ticks across caching and execution.
    pub fn overall_ticks(&self) -> usize {
        self.package_count + self.cache_package_count
    }
}

#[derive(Debug, Clone)]
struct ActiveBoundary {
    id: String,
    transaction: bool,
    execute_start: usize,
    rollback_start: usize,
    has_packages: bool,
}

/// The ordered work for one apply.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub action: BundleAction,
    pub per_machine: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layout_directory: Option<PathBuf>,

    pub registration: Vec<RegistrationAction>,
    pub rollback_registration: Vec<RegistrationAction>,
    pub cache: Vec<Planned<CacheAction>>,
    pub rollback_cache: Vec<Planned<CacheAction>>,
    pub execute: Vec<Planned<ExecuteAction>>,
    pub rollback: Vec<Planned<ExecuteAction>>,
    pub clean: Vec<CleanAction>,
    pub totals: PlanTotals,

    #[serde(skip)]
    next_checkpoint: u32,
    #[serde(skip)]
    active_boundary: Option<ActiveBoundary>,
    /// Container id to the index of its extract action in `cache`.
    #[serde(skip)]
    extracts: HashMap<String, usize>,
}

impl Plan {
    pub fn new(action: BundleAction) -> Self {
        Self {
            action,
            per_machine: false,
            layout_directory: None,
            registration: Vec::new(),
            rollback_registration: Vec::new(),
            cache: Vec::new(),
            rollback_cache: Vec::new(),
            execute: Vec::new(),
            rollback: Vec::new(),
            clean: Vec::new(),
            totals: PlanTotals::default(),
            next_checkpoint: 0,
            active_boundary: None,
            extracts: HashMap::new(),
        }
    }

    pub fn append_execute(&mut self, action: ExecuteAction) -> usize {
        self.execute.push(Planned::new(action));
        self.execute.len() - 1
    }

    pub fn append_rollback(&mut self, action: ExecuteAction) -> usize {
        self.rollback.push(Planned::new(action));
        self.rollback.len() - 1
    }

    pub fn append_cache(&mut self, action: CacheAction) -> usize {
        self.cache.push(Planned::new(action));
        self.cache.len() - 1
    }

    pub fn append_rollback_cache(&mut self, action: CacheAction) -> usize {
        self.rollback_cache.push(Planned::new(action));
        self.rollback_cache.len() - 1
    }

    fn next_checkpoint_id(&mut self) -> u32 {
        self.next_checkpoint += 1;
        self.next_checkpoint
    }

    /// Append one checkpoint to the execute list and its twin to the
    /// rollback list. Returns the id.
    pub fn execute_checkpoint(&mut self) -> u32 {
        let id = self.next_checkpoint_id();
        let boundary = self.active_boundary.as_ref().map(|b| b.id.clone());
        self.append_execute(ExecuteAction::Checkpoint {
            id,
            boundary: boundary.clone(),
        });
        self.append_rollback(ExecuteAction::Checkpoint { id, boundary });
        id
    }

    /// Same as [`execute_checkpoint`](Self::execute_checkpoint) for the cache lists.
    pub fn cache_checkpoint(&mut self) -> u32 {
        let id = self.next_checkpoint_id();
        self.append_cache(CacheAction::Checkpoint { id });
        self.append_rollback_cache(CacheAction::Checkpoint { id });
        id
    }

    pub fn active_boundary(&self) -> Option<&str> {
        self.active_boundary.as_ref().map(|b| b.id.as_str())
    }

    /// Start a rollback boundary, ending the active one.
    pub fn begin_boundary(&mut self, boundary: &RollbackBoundary) {
        self.end_boundary();
        let execute_start = self.append_execute(ExecuteAction::RollbackBoundaryStart {
            boundary_id: boundary.id.clone(),
            vital: boundary.vital,
            transaction: boundary.transaction,
        });
        let rollback_start = self.append_rollback(ExecuteAction::RollbackBoundaryStart {
            boundary_id: boundary.id.clone(),
            vital: boundary.vital,
            transaction: boundary.transaction,
        });
        if boundary.transaction {
            self.append_execute(ExecuteAction::BeginMsiTransaction {
                boundary_id: boundary.id.clone(),
            });
        }
        self.active_boundary = Some(ActiveBoundary {
            id: boundary.id.clone(),
            transaction: boundary.transaction,
            execute_start,
            rollback_start,
            has_packages: false,
        });
    }

    /// Record that the active boundary encloses a package action.
    pub fn note_boundary_package(&mut self) {
        if let Some(active) = &mut self.active_boundary {
            active.has_packages = true;
        }
    }

    /// Close the active boundary. A boundary that enclosed nothing is
    /// tombstoned rather than removed.
    pub fn end_boundary(&mut self) {
        let Some(active) = self.active_boundary.take() else {
            return;
        };
        if !active.has_packages {
            let tx = usize::from(active.transaction);
            for planned in &mut self.execute[active.execute_start..=active.execute_start + tx] {
                planned.deleted = true;
            }
            self.rollback[active.rollback_start].deleted = true;
            return;
        }
        if active.transaction {
            self.append_execute(ExecuteAction::CommitMsiTransaction {
                boundary_id: active.id.clone(),
            });
        }
        self.append_execute(ExecuteAction::RollbackBoundaryEnd {
            boundary_id: active.id,
        });
    }

    pub(crate) fn has_extract(&self, container_id: &str) -> bool {
        self.extracts.contains_key(container_id)
    }

    /// Add `payload_key` to the container's extract action, creating it
    /// on first use. Returns true when the action was created.
    pub(crate) fn extract_payload(&mut self, container_id: &str, payload_key: &str) -> bool {
        if let Some(&index) = self.extracts.get(container_id)
            && let CacheAction::ExtractContainer { payload_keys, .. } =
                &mut self.cache[index].action
        {
            if !payload_keys.iter().any(|k| k == payload_key) {
                payload_keys.push(payload_key.to_string());
            }
            return false;
        }
        let index = self.append_cache(CacheAction::ExtractContainer {
            container_id: container_id.to_string(),
            payload_keys: vec![payload_key.to_string()],
        });
        self.extracts.insert(container_id.to_string(), index);
        true
    }

    /// Close the plan: end the boundary, add the final checkpoint and count.
    pub(crate) fn finalize(&mut self) {
        self.end_boundary();
        self.execute_checkpoint();
        self.totals.package_count = self
            .execute
            .iter()
            .filter_map(Planned::live)
            .filter(|a| a.is_package())
            .count();
    }

    /// Live execute actions in order.
    pub fn live_execute(&self) -> impl Iterator<Item = &ExecuteAction> {
        self.execute.iter().filter_map(Planned::live)
    }

    /// Live rollback actions in order.
    pub fn live_rollback(&self) -> impl Iterator<Item = &ExecuteAction> {
        self.rollback.iter().filter_map(Planned::live)
    }

    /// Index of checkpoint `id` in the rollback list.
    pub fn rollback_checkpoint_index(&self, id: u32) -> Option<usize> {
        self.rollback.iter().position(|p| {
            !p.deleted && matches!(p.action, ExecuteAction::Checkpoint { id: c, .. } if c == id)
        })
    }

    /// Index of checkpoint `id` in the rollback cache list.
    pub fn rollback_cache_checkpoint_index(&self, id: u32) -> Option<usize> {
        self.rollback_cache.iter().position(|p| {
            !p.deleted && matches!(p.action, CacheAction::Checkpoint { id: c } if c == id)
        })
    }

    /// Re-arm every cache sync point.
    pub fn reset_sync_points(&self) {
        for planned in &self.cache {
            if let CacheAction::SignalSyncPoint { sync } = &planned.action {
                sync.reset();
            }
        }
    }

    /// Whether any work needs machine-wide rights.
    pub fn needs_elevation(&self) -> bool {
        self.per_machine
    }

    pub fn is_empty(&self) -> bool {
        self.live_execute().all(|a| !a.is_package())
            && self.cache.iter().all(|p| p.deleted)
            && self.registration.is_empty()
            && self.clean.is_empty()
    }
}
