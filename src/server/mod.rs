//! The dispatcher: accepts client connections and hands each one to a worker.
//!
//! The dispatcher is single-threaded. It keeps a pool of worker processes,
//! reuses an idle one for each new connection and starts another when all are
//! busy. It never reads from or writes to a client connection; it only passes
//! the descriptor along.
//!
//! # Example
//!
//! ```bash
//! # Run in the foreground (e.g. as a container's main process)
//! comprunner serve
//!
//! # Submit a job; starts a detached dispatcher if none is running
//! comprunner run image.png -P ROTATION=90
//! ```

pub mod handle;
pub mod stats;

pub use handle::{WorkerCommand, WorkerHandle};
pub use stats::Stats;

use crate::config::{IdleTimeout, SERVER_LOG_ENV};
use crate::error::{Result, RunnerError};
use crate::ipc::{poll_readable, transport};
use crate::paths::server_log_file_name;
use nix::fcntl::OFlag;
use nix::unistd::{dup2_stderr, dup2_stdin, dup2_stdout, pipe2};
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Abstract socket name to listen on.
    pub socket_name: String,
    /// Exit after this long with no workers and no connections.
    pub idle_timeout: IdleTimeout,
    /// Passed to every worker started.
    pub worker_idle_timeout: IdleTimeout,
    pub worker_command: WorkerCommand,
}

/// Wakes a running [`Dispatcher::serve`] so that it shuts down.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    write: Arc<OwnedFd>,
}

impl ShutdownHandle {
    /// Request shutdown. Safe to call from any thread, any number of times.
    pub fn trigger(&self) {
        let _ = nix::unistd::write(&*self.write, &[1]);
    }
}

/// Why the dispatcher's wait ended.
#[derive(Debug)]
enum Wake {
    Connection,
    Shutdown,
    IdleTimeout,
    /// Indices of workers whose control channel is readable.
    Workers(Vec<usize>),
}

/// Index of the listener and the shutdown pipe in the poll set; workers follow.
const LISTENER_SLOT: usize = 0;
const SHUTDOWN_SLOT: usize = 1;
const FIRST_WORKER_SLOT: usize = 2;

pub struct Dispatcher {
    config: DispatcherConfig,
    listener: UnixListener,
    workers: Vec<WorkerHandle>,
    stats: Stats,
    shutdown_read: OwnedFd,
    shutdown_write: Arc<OwnedFd>,
}

impl Dispatcher {
    /// Bind the listening socket.
    ///
    /// Fails with [`RunnerError::AddressInUse`] when another dispatcher already
    /// listens on the same name.
    pub fn bind(config: DispatcherConfig) -> Result<Self> {
        let listener = transport::bind(&config.socket_name)?;
        let (shutdown_read, shutdown_write) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        info!(
            socket = %config.socket_name,
            idle_timeout = %config.idle_timeout,
            "Dispatcher listening"
        );
        Ok(Self {
            config,
            listener,
            workers: Vec::new(),
            stats: Stats::default(),
            shutdown_read,
            shutdown_write: Arc::new(shutdown_write),
        })
    }

    pub fn socket_name(&self) -> &str {
        &self.config.socket_name
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            write: Arc::clone(&self.shutdown_write),
        }
    }

    /// Accept and dispatch jobs until the idle timeout expires or shutdown is requested.
    ///
    /// On error every worker is killed before the error is returned.
    pub fn serve(&mut self) -> Result<Stats> {
        info!("server pid = {}", std::process::id());
        let result = self.serve_loop();
        debug!("{}", self.stats);
        if result.is_err() {
            self.terminate_all();
        }
        result.map(|()| self.stats.clone())
    }

    fn serve_loop(&mut self) -> Result<()> {
        while let Some(client) = self.wait_for_accept()? {
            self.handle_single_request(&client)?;
        }
        Ok(())
    }

    /// Returns `None` when the dispatcher should stop.
    fn wait_for_accept(&mut self) -> Result<Option<UnixStream>> {
        // Loops when woken by a worker finishing a job or exiting.
        loop {
            self.reap_workers();
            debug!("{}", self.stats);
            match self.wait(self.idle_exit_timeout())? {
                Wake::Connection => {
                    let (client, _) = self.listener.accept()?;
                    return Ok(Some(client));
                }
                Wake::Shutdown => {
                    info!("Shutdown requested, stopping {} worker(s)", self.workers.len());
                    self.terminate_all();
                    return Ok(None);
                }
                Wake::IdleTimeout => {
                    info!("Exiting due to idle");
                    return Ok(None);
                }
                Wake::Workers(ready) => {
                    for index in ready {
                        if let Some(worker) = self.workers.get_mut(index) {
                            worker.on_control_ready();
                        }
                    }
                }
            }
        }
    }

    /// The idle timeout applies only with no workers, and never to pid 1.
    fn idle_exit_timeout(&self) -> Option<Duration> {
        if self.workers.is_empty() && std::process::id() != 1 {
            self.config.idle_timeout.duration()
        } else {
            None
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Wake> {
        let mut fds = vec![self.listener.as_fd(), self.shutdown_read.as_fd()];
        fds.extend(self.workers.iter().map(WorkerHandle::control_fd));

        let ready = poll_readable(&fds, timeout)?;
        if ready.is_empty() {
            return Ok(Wake::IdleTimeout);
        }
        // New jobs take priority over bookkeeping for exited workers.
        if ready.contains(&LISTENER_SLOT) {
            return Ok(Wake::Connection);
        }
        if ready.contains(&SHUTDOWN_SLOT) {
            return Ok(Wake::Shutdown);
        }
        Ok(Wake::Workers(
            ready.into_iter().map(|slot| slot - FIRST_WORKER_SLOT).collect(),
        ))
    }

    fn handle_single_request(&mut self, client: &UnixStream) -> Result<()> {
        self.stats.on_job_received();
        loop {
            let index = self.find_idle_process()?;
            match self.workers[index].submit(client) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    info!(
                        "Resubmitting job because selected child process exited as the job \
                         was submitted."
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn find_idle_process(&mut self) -> Result<usize> {
        if let Some(index) = self
            .workers
            .iter_mut()
            .position(|w| w.is_alive() && w.is_idle())
        {
            info!("Re-using existing process for job.");
            return Ok(index);
        }

        info!("Creating new executor process");
        let worker = WorkerHandle::spawn(
            &self.config.worker_command,
            self.config.worker_idle_timeout,
        )?;
        self.workers.push(worker);
        self.stats.on_process_started(self.workers.len());
        Ok(self.workers.len() - 1)
    }

    fn reap_workers(&mut self) {
        let before = self.workers.len();
        let mut still_alive = Vec::with_capacity(before);
        for mut worker in self.workers.drain(..) {
            if worker.is_alive() {
                still_alive.push(worker);
            } else {
                self.stats.on_process_exited(worker.cleanup());
            }
        }
        let removed = before - still_alive.len();
        if removed != 0 {
            info!("Reaping {} processes.", removed);
        }
        self.workers = still_alive;
    }

    fn terminate_all(&mut self) {
        for mut worker in self.workers.drain(..) {
            worker.terminate();
            self.stats.on_process_exited(worker.cleanup());
        }
    }
}

/// Log file of a detached dispatcher: `$COMPRUNNER_SERVER_LOG`, or
/// `component-server-<pid>.log` in the working directory.
pub fn server_log_path() -> PathBuf {
    std::env::var_os(SERVER_LOG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| server_log_file_name(std::process::id()))
}

/// Detach from the starting process's terminal: stdin from `/dev/null`,
/// stdout and stderr appended to `log_path`.
pub fn detach_stdio(log_path: &Path) -> Result<()> {
    let dev_null = File::open("/dev/null")?;
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            RunnerError::Worker(format!(
                "Failed to open server log {}: {}",
                log_path.display(),
                e
            ))
        })?;
    dup2_stdin(&dev_null)?;
    dup2_stdout(&log)?;
    dup2_stderr(&log)?;
    Ok(())
}
