//! The engine's action queue and activity flag.
//!
//! Requests that start engine work are queued and drained one at a time by
//! the engine loop. Requests that only read or tweak state are answered
//! immediately, but setters refuse while an action is running.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::hresult::HResult;
use crate::model::BundleAction;

/// Work the engine loop performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    Detect,
    Plan(BundleAction),
    Elevate,
    Apply,
    LaunchApprovedExe {
        id: String,
        arguments: Option<String>,
        wait: Option<Duration>,
    },
    Quit(u32),
}

impl EngineAction {
    pub fn name(&self) -> &'static str {
        match self {
            EngineAction::Detect => "detect",
            EngineAction::Plan(_) => "plan",
            EngineAction::Elevate => "elevate",
            EngineAction::Apply => "apply",
            EngineAction::LaunchApprovedExe { .. } => "launch_approved_exe",
            EngineAction::Quit(_) => "quit",
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    actions: VecDeque<EngineAction>,
    quitting: bool,
}

/// FIFO of [`EngineAction`]s shared between request handlers and the
/// engine loop.
#[derive(Debug, Default)]
pub struct ActionQueue {
    state: Mutex<QueueState>,
    ready: Notify,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an action. Fails with `INVALID_STATE` once the engine has
    /// started quitting.
    pub fn enqueue(&self, action: EngineAction) -> Result<(), HResult> {
        {
            let mut state = self.lock();
            if state.quitting {
                warn!(action = action.name(), "Ignoring action requested after quit");
                return Err(HResult::INVALID_STATE);
            }
            debug!(action = action.name(), queued = state.actions.len(), "Action queued");
            state.actions.push_back(action);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Wait for the next action.
    pub async fn next(&self) -> EngineAction {
        loop {
            if let Some(action) = self.lock().actions.pop_front() {
                return action;
            }
            self.ready.notified().await;
        }
    }

    /// Record that the engine is quitting. Anything still queued is dropped
    /// and later enqueues are rejected.
    pub fn mark_quitting(&self) {
        let mut state = self.lock();
        state.quitting = true;
        if !state.actions.is_empty() {
            warn!(dropped = state.actions.len(), "Dropping actions queued behind quit");
            state.actions.clear();
        }
    }

    /// Accept actions again, for the next application session.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.quitting = false;
        state.actions.clear();
    }

    pub fn is_quitting(&self) -> bool {
        self.lock().quitting
    }

    pub fn len(&self) -> usize {
        self.lock().actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether a queued action is running.
#[derive(Debug, Default)]
pub struct EngineActivity {
    active: Mutex<bool>,
}

/// Clears the activity flag when dropped.
#[derive(Debug)]
pub struct ActiveGuard<'a> {
    activity: &'a EngineActivity,
}

impl EngineActivity {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the engine active until the guard drops.
    pub fn activate(&self) -> ActiveGuard<'_> {
        *self.lock() = true;
        ActiveGuard { activity: self }
    }

    /// Fail with `BUSY` while an action runs.
    pub fn ensure_inactive(&self) -> Result<(), HResult> {
        if *self.lock() {
            Err(HResult::BUSY)
        } else {
            Ok(())
        }
    }

    pub fn is_active(&self) -> bool {
        *self.lock()
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.activity.lock() = false;
    }
}
