//! Built-in application for unattended runs.
//!
//! Drives detect, plan and apply for one action and quits with an exit
//! code derived from the outcome. Every prompt gets the default answer.

use std::sync::Arc;

use tracing::{info, warn};

use super::events::{BaEvent, BaReply, BootstrapperApplication};
use super::queue::{ActionQueue, EngineAction};
use crate::BoxFuture;
use crate::hresult::HResult;
use crate::model::{BundleAction, Restart};

/// `ERROR_SUCCESS_REBOOT_REQUIRED`
pub const EXIT_RESTART_REQUIRED: u32 = 3010;
/// `ERROR_SUCCESS_RESTART_REQUIRED` after a restart was started.
pub const EXIT_RESTART_INITIATED: u32 = 1641;

/// Process exit code for a final status.
pub fn exit_code(status: HResult, restart: Restart) -> u32 {
    if status.is_failure() {
        return status.win32_code().unwrap_or(status.as_u32());
    }
    match restart {
        Restart::None => 0,
        Restart::Required => EXIT_RESTART_REQUIRED,
        Restart::Initiated => EXIT_RESTART_INITIATED,
    }
}

#[derive(Debug)]
pub struct PassiveBa {
    queue: Arc<ActionQueue>,
    action: BundleAction,
}

impl PassiveBa {
    pub fn new(queue: Arc<ActionQueue>, action: BundleAction) -> Self {
        Self { queue, action }
    }

    fn queue(&self, action: EngineAction) {
        if let Err(hr) = self.queue.enqueue(action) {
            warn!(%hr, "Passive application could not queue its next step");
        }
    }

    fn next_or_quit(&self, status: HResult, next: EngineAction) {
        if status.is_success() {
            self.queue(next);
        } else {
            self.queue(EngineAction::Quit(exit_code(status, Restart::None)));
        }
    }
}

impl BootstrapperApplication for PassiveBa {
    fn on_event(&self, event: BaEvent) -> BoxFuture<'_, BaReply> {
        Box::pin(async move {
            match event {
                BaEvent::Startup => self.queue(EngineAction::Detect),
                BaEvent::DetectComplete { status } => {
                    self.next_or_quit(status, EngineAction::Plan(self.action));
                }
                BaEvent::PlanComplete { status } => self.next_or_quit(status, EngineAction::Apply),
                BaEvent::ApplyComplete { status, restart } => {
                    info!(%status, ?restart, "Apply finished");
                    self.queue(EngineAction::Quit(exit_code(status, restart)));
                }
                BaEvent::ExecutePackageBegin {
                    package_id,
                    execute: true,
                    action,
                } => info!(package = %package_id, ?action, "Executing package"),
                BaEvent::Error {
                    package_id,
                    code,
                    message,
                    ..
                } => warn!(package = ?package_id, %code, %message, "Error reported"),
                _ => {}
            }
            BaReply::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(HResult::S_OK, Restart::None), 0);
        assert_eq!(exit_code(HResult::S_OK, Restart::Required), 3010);
        assert_eq!(exit_code(HResult::INSTALL_FAILURE, Restart::Required), 1603);
        assert_eq!(exit_code(HResult::E_FAIL, Restart::None), 0x8000_4005);
    }

    #[tokio::test]
    async fn test_drives_the_sequence() {
        let queue = Arc::new(ActionQueue::new());
        let ba = PassiveBa::new(Arc::clone(&queue), BundleAction::Install);
        ba.on_event(BaEvent::Startup).await;
        assert_eq!(queue.next().await, EngineAction::Detect);
        ba.on_event(BaEvent::DetectComplete {
            status: HResult::S_OK,
        })
        .await;
        assert_eq!(queue.next().await, EngineAction::Plan(BundleAction::Install));
        ba.on_event(BaEvent::PlanComplete {
            status: HResult::INSTALL_USEREXIT,
        })
        .await;
        assert_eq!(queue.next().await, EngineAction::Quit(1602));
    }
}
