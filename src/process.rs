//! Child process bookkeeping shared by worker handles and subprocess plugins.
//!
//! Wraps a pid with non-blocking liveness checks, bounded waits and a cached
//! wait status, and turns that status into a process-style exit code.

use crate::error::{Result, RunnerError};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::fmt;
use std::time::{Duration, Instant};

/// Poll interval for bounded waits.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reason why a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillAlive,
    /// The status could not be determined (for example the pid was already reaped).
    Unknown,
}

impl TerminationReason {
    /// Exit code in shell convention: signals map to `128 + signo`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(sig) => 128 + *sig as i32,
            Self::StillAlive | Self::Unknown => -1,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// A spawned child that this process is responsible for reaping.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    /// Set once the child has been reaped.
    status: Option<TerminationReason>,
}

impl ChildProcess {
    pub fn new(pid: Pid) -> Self {
        Self { pid, status: None }
    }

    /// Take over reaping of a `std::process::Child`.
    pub fn from_child(child: &std::process::Child) -> Self {
        Self::new(Pid::from_raw(child.id() as i32))
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Try to wait for the process (non-blocking).
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record(analyze_wait_status(status)))),
            Err(nix::errno::Errno::ECHILD) => Ok(Some(self.record(TerminationReason::Unknown))),
            Err(e) => Err(RunnerError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Ok(self.record(analyze_wait_status(status))),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => {
                    return Ok(self.record(TerminationReason::Unknown));
                }
                Err(e) => return Err(RunnerError::Worker(format!("waitpid failed: {}", e))),
            }
        }
    }

    /// Wait up to `timeout` for the process to exit.
    ///
    /// Returns `None` if it is still running when the timeout expires.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<TerminationReason>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Send SIGKILL to the process without waiting.
    pub fn kill(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(RunnerError::Worker(format!("Failed to send SIGKILL: {}", e))),
        }
    }

    /// Wait up to `grace` for a voluntary exit, then SIGKILL and reap.
    pub fn stop(&mut self, grace: Duration) -> Result<TerminationReason> {
        if let Some(status) = self.wait_timeout(grace)? {
            return Ok(status);
        }
        tracing::debug!(pid = self.pid.as_raw(), "Process did not exit in time, killing it");
        self.kill()?;
        self.wait()
    }

    fn record(&mut self, status: TerminationReason) -> TerminationReason {
        self.status = Some(status);
        status
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.status.is_none() {
            let _ = self.kill();
            let _ = self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_exit_codes() {
        assert_eq!(TerminationReason::Exited(0).exit_code(), 0);
        assert_eq!(TerminationReason::Exited(3).exit_code(), 3);
        assert_eq!(TerminationReason::Signaled(Signal::SIGKILL).exit_code(), 137);
        assert_eq!(TerminationReason::Signaled(Signal::SIGTERM).exit_code(), 143);
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1234);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 3)),
            TerminationReason::Exited(3)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, false)),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::StillAlive
        );
    }

    #[test]
    fn test_description() {
        assert_eq!(
            TerminationReason::Exited(2).to_string(),
            "exited with code 2"
        );
        assert!(
            TerminationReason::Signaled(Signal::SIGKILL)
                .to_string()
                .contains("SIGKILL")
        );
    }

    #[test]
    fn test_wait_for_exit() {
        let child = Command::new("sh").args(["-c", "exit 4"]).spawn().unwrap();
        let mut proc = ChildProcess::from_child(&child);
        assert_eq!(proc.wait().unwrap(), TerminationReason::Exited(4));
        assert!(!proc.is_running());
        assert_eq!(proc.try_wait().unwrap(), Some(TerminationReason::Exited(4)));
    }

    #[test]
    fn test_stop_kills_after_grace() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut proc = ChildProcess::from_child(&child);
        assert!(proc.is_running());

        let status = proc.stop(Duration::from_millis(50)).unwrap();
        assert_eq!(status, TerminationReason::Signaled(Signal::SIGKILL));
        assert_eq!(status.exit_code(), 137);
    }

    #[test]
    fn test_wait_timeout_still_running() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut proc = ChildProcess::from_child(&child);
        assert_eq!(proc.wait_timeout(Duration::from_millis(20)).unwrap(), None);
        // Drop kills and reaps.
    }
}
