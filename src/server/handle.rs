//! The dispatcher's view of one worker process.
//!
//! Each worker is started with one end of a socket pair as its stdin. The
//! dispatcher passes accepted client connections over the other end and the
//! worker answers with one byte per finished job. The dispatcher never reads
//! or writes the client connection itself.

use crate::config::IdleTimeout;
use crate::error::{Result, RunnerError};
use crate::ipc::{is_broken_connection, send_fds};
use crate::process::{ChildProcess, TerminationReason};
use std::ffi::OsString;
use std::io::{self, Read};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a worker gets to exit on its own before it is killed during cleanup.
const CLEANUP_GRACE: Duration = Duration::from_millis(500);

/// How to start a worker process.
///
/// `worker --idle-timeout=<secs>` is appended to the configured arguments.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Run workers from this executable.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe().map_err(|e| {
            RunnerError::Worker(format!("Failed to get current executable: {}", e))
        })?;
        Ok(Self::new(exe))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn build(&self, idle_timeout: IdleTimeout) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("worker")
            .arg(format!("--idle-timeout={}", idle_timeout));
        cmd
    }
}

/// A running worker and its control channel.
#[derive(Debug)]
pub struct WorkerHandle {
    process: ChildProcess,
    control: UnixStream,
    idle: bool,
    /// Set when the control channel failed or hit EOF; the worker is exiting.
    broken_pipe: bool,
}

impl WorkerHandle {
    /// Start a worker.
    pub fn spawn(command: &WorkerCommand, idle_timeout: IdleTimeout) -> Result<Self> {
        let (control, worker_end) = UnixStream::pair()?;
        let mut cmd = command.build(idle_timeout);
        cmd.stdin(Stdio::from(OwnedFd::from(worker_end)))
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        let child = cmd
            .spawn()
            .map_err(|e| RunnerError::Worker(format!("Failed to start worker: {}", e)))?;
        // Closes our copy of the worker's end.
        drop(cmd);

        control.set_nonblocking(true)?;
        let process = ChildProcess::from_child(&child);
        debug!(pid = process.pid().as_raw(), "Started worker");
        Ok(Self {
            process,
            control,
            idle: true,
            broken_pipe: false,
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid().as_raw()
    }

    /// Descriptor that becomes readable when the worker finishes a job or exits.
    pub fn control_fd(&self) -> BorrowedFd<'_> {
        self.control.as_fd()
    }

    /// Hand a client connection to this worker.
    ///
    /// Fails with [`RunnerError::WorkerBusy`] if a job is already running and
    /// with the retryable [`RunnerError::WorkerUnavailable`] if the worker
    /// exited before it could take the connection.
    pub fn submit(&mut self, client: &UnixStream) -> Result<()> {
        if !self.idle {
            return Err(RunnerError::WorkerBusy { pid: self.pid() });
        }
        self.idle = false;
        match send_fds(&self.control, &[client.as_raw_fd()]) {
            Ok(()) => Ok(()),
            Err(e) if is_broken_connection(&e) => {
                self.broken_pipe = true;
                Err(RunnerError::WorkerUnavailable { pid: self.pid() })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the worker is waiting for a job. Consumes a pending completion byte.
    pub fn is_idle(&mut self) -> bool {
        if !self.idle {
            self.read_control();
        }
        self.idle
    }

    /// Process whatever made the control channel readable.
    pub fn on_control_ready(&mut self) {
        self.read_control();
    }

    fn read_control(&mut self) {
        let mut buf = [0u8; 1];
        loop {
            match (&self.control).read(&mut buf) {
                Ok(0) => {
                    self.broken_pipe = true;
                    return;
                }
                Ok(_) => {
                    self.idle = true;
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(pid = self.pid(), "Control channel failed: {}", e);
                    self.broken_pipe = true;
                    return;
                }
            }
        }
    }

    /// Whether the process is running and its control channel still works.
    pub fn is_alive(&mut self) -> bool {
        !self.broken_pipe && self.process.is_running()
    }

    /// Reap the worker, killing it if it does not exit within a short grace
    /// period. Returns its exit code (`128 + signo` for signals).
    pub fn cleanup(&mut self) -> i32 {
        let status = self.process.stop(CLEANUP_GRACE).unwrap_or_else(|e| {
            warn!(pid = self.pid(), "Failed to reap worker: {}", e);
            TerminationReason::Unknown
        });
        let exit_code = status.exit_code();
        info!("Process {} exited with exit code {}", self.pid(), exit_code);
        exit_code
    }

    /// Kill the worker immediately.
    pub fn terminate(&mut self) {
        if let Err(e) = self.process.kill() {
            warn!(pid = self.pid(), "Failed to kill worker: {}", e);
        }
    }
}

/// A worker command running `script` under `sh`, for tests.
#[cfg(test)]
pub(crate) fn scripted_worker(script: &str) -> WorkerCommand {
    WorkerCommand::new("sh")
        .arg("-c")
        .arg(script)
        .arg("fake-worker")
}

/// Answers every job with a completion byte, like a real worker.
#[cfg(test)]
pub(crate) const ECHO_WORKER: &str =
    r#"while [ "$(dd bs=1 count=1 2>/dev/null | wc -c)" -eq 1 ]; do printf x >&0; done"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_worker_command_arguments() {
        let cmd = WorkerCommand::new("/usr/bin/comprunner")
            .arg("--socket")
            .arg("test")
            .build(IdleTimeout::from_secs(30));
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["--socket", "test", "worker", "--idle-timeout=30"]);

        let cmd = WorkerCommand::new("comprunner").build(IdleTimeout::DISABLED);
        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, ["worker", "--idle-timeout=-1"]);
    }

    #[test]
    fn test_job_completion_makes_worker_idle() {
        let mut worker =
            WorkerHandle::spawn(&scripted_worker(ECHO_WORKER), IdleTimeout::DISABLED).unwrap();
        assert!(worker.is_alive());
        assert!(worker.is_idle());

        let (client, _peer) = UnixStream::pair().unwrap();
        worker.submit(&client).unwrap();
        assert!(matches!(
            worker.submit(&client),
            Err(RunnerError::WorkerBusy { .. })
        ));
        assert!(wait_until(|| worker.is_idle()));

        // Idle again, so it can take the next job.
        worker.submit(&client).unwrap();
        assert!(wait_until(|| worker.is_idle()));

        worker.terminate();
        assert_eq!(worker.cleanup(), 137);
    }

    #[test]
    fn test_exited_worker() {
        let mut worker =
            WorkerHandle::spawn(&scripted_worker("exit 4"), IdleTimeout::DISABLED).unwrap();
        assert!(wait_until(|| !worker.is_alive()));
        assert_eq!(worker.cleanup(), 4);
    }

    #[test]
    fn test_submit_to_exited_worker_is_retryable() {
        let mut worker =
            WorkerHandle::spawn(&scripted_worker("exit 0"), IdleTimeout::DISABLED).unwrap();
        assert!(wait_until(|| !worker.is_alive()));

        let (client, _peer) = UnixStream::pair().unwrap();
        let err = worker.submit(&client).unwrap_err();
        assert!(err.is_retryable());
        assert!(!worker.is_alive());
        assert_eq!(worker.cleanup(), 0);
    }

    #[test]
    fn test_exit_is_seen_on_control_channel() {
        let mut worker =
            WorkerHandle::spawn(&scripted_worker("exit 0"), IdleTimeout::DISABLED).unwrap();
        assert!(wait_until(|| {
            worker.on_control_ready();
            worker.broken_pipe
        }));
        assert!(!worker.is_alive());
        worker.cleanup();
    }
}
