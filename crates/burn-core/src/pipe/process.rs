//! Liveness checks for the process on the other end of a pipe.

use std::time::Duration;

use tokio::process::Child;

use super::PipeError;

/// Something that can say whether a peer process is still alive.
pub trait ProcessWatch: Send {
    fn is_running(&mut self) -> bool;
}

impl ProcessWatch for Child {
    fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }
}

/// The parent process, tracked by pid.
#[derive(Debug, Clone, Copy)]
pub struct ParentProcess {
    pid: u32,
}

impl ParentProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl ProcessWatch for ParentProcess {
    fn is_running(&mut self) -> bool {
        if cfg!(target_os = "linux") {
            std::path::Path::new("/proc")
                .join(self.pid.to_string())
                .exists()
        } else {
            true
        }
    }
}

/// A peer that is not a separate process, or is not tracked.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unwatched;

impl ProcessWatch for Unwatched {
    fn is_running(&mut self) -> bool {
        true
    }
}

/// Result of waiting for a child to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitWait {
    /// Exited; `None` when killed by a signal.
    Exited(Option<i32>),
    TimedOut,
}

/// Wait up to `timeout` for `child` to exit.
pub async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<ExitWait, PipeError> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(ExitWait::Exited(status?.code())),
        Err(_) => Ok(ExitWait::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_running() {
        let mut me = ParentProcess::new(std::process::id());
        assert!(me.is_running());
        assert_eq!(me.pid(), std::process::id());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_process_is_not_running() {
        let mut ghost = ParentProcess::new(u32::MAX - 1);
        assert!(!ghost.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_for_exit() {
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        let outcome = wait_for_exit(&mut child, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome, ExitWait::Exited(Some(0)));
        assert!(!child.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_wait_for_exit_times_out() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("5")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let outcome = wait_for_exit(&mut child, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome, ExitWait::TimedOut);
        assert!(child.is_running());
    }
}
