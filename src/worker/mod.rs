//! The worker process: runs jobs the dispatcher hands it, one at a time.
//!
//! A worker's stdin is its control channel to the dispatcher. Each job
//! arrives on it as a passed client connection; after the job the worker
//! writes [`JOB_DONE`] back. Two threads share a [`JobSync`]:
//!
//! - the runner receives and executes jobs and owns the component
//! - the main thread watches the active client connection and cancels the
//!   job if the client goes away early
//!
//! The main thread is the watcher so that signals keep being delivered to a
//! thread that is never stuck inside a component.

pub mod job;
pub mod output;
pub mod request;
pub mod sync;

use crate::component::CancelToken;
use crate::config::IdleTimeout;
use crate::error::{Result, RunnerError};
use crate::ipc::{poll_readable, recv_exact_fds};
use crate::logging::LogHandle;
use crate::protocol::{JOB_DONE, exit_code};
use job::{ClientContext, ComponentSlot, JobArgs, ParsedJob};
use nix::sys::signal::{SigHandler, Signal, signal};
use request::JobRequest;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use sync::{JobSync, WatchOutcome};
use tracing::{debug, error, info, warn};

/// Exit code of a worker that retires after an aborted job.
pub const RETIRED_AFTER_ABORT: i32 = exit_code::ABORTED as i32;

/// Worker settings passed down by the dispatcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerConfig {
    /// How long to wait for a job before exiting.
    pub idle_timeout: IdleTimeout,
}

/// What the runner does after a job.
#[derive(Debug)]
enum Next {
    Continue,
    /// Exit with this code without reporting the job done.
    Retire(i32),
    /// The worker cannot run more jobs.
    Fatal(RunnerError),
}

/// Run the worker until it idles out or its control channel closes.
///
/// Returns the process exit code.
pub fn run_worker(config: WorkerConfig, log: LogHandle) -> Result<i32> {
    // Ignore SIGPIPE - a departed client shows up as EPIPE
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigIgn).ok();
    }

    let control = take_control_channel()?;
    // fd 2 points at a client during jobs; keep the worker's own log for plugins.
    let diagnostics = io::stderr().as_fd().try_clone_to_owned()?;
    info!("Executor process started with pid {}.", std::process::id());

    let sync = Arc::new(JobSync::new());
    let runner = {
        let sync = Arc::clone(&sync);
        thread::Builder::new()
            .name("job-runner".into())
            .spawn(move || {
                let mut runner = JobRunner::new(control, config, log, diagnostics);
                let result = runner.run(&sync);
                sync.close();
                result
            })?
    };

    loop {
        match sync.watch_next_job() {
            WatchOutcome::Closed => break,
            WatchOutcome::ClientAborted => debug!("Job cancelled after client disconnect"),
            WatchOutcome::Completed => {}
        }
    }
    sync.close();

    runner
        .join()
        .map_err(|_| RunnerError::Worker("Job runner thread panicked".into()))?
}

/// Move the control socket off fd 0 and put `/dev/null` there instead.
fn take_control_channel() -> Result<UnixStream> {
    let control = io::stdin().as_fd().try_clone_to_owned()?;
    let dev_null = File::open("/dev/null")?;
    nix::unistd::dup2_stdin(&dev_null)?;
    Ok(UnixStream::from(control))
}

struct JobRunner {
    control: UnixStream,
    config: WorkerConfig,
    log: LogHandle,
    component: ComponentSlot,
}

impl JobRunner {
    fn new(
        control: UnixStream,
        config: WorkerConfig,
        log: LogHandle,
        diagnostics: OwnedFd,
    ) -> Self {
        Self {
            control,
            config,
            log,
            component: ComponentSlot::with_diagnostics(diagnostics),
        }
    }

    fn run(&mut self, sync: &JobSync) -> Result<i32> {
        loop {
            let ready = poll_readable(&[self.control.as_fd()], self.config.idle_timeout.duration())?;
            if ready.is_empty() {
                info!("Executor process exiting due to idle timeout.");
                return Ok(0);
            }

            let client = match recv_exact_fds(&self.control, 1) {
                Ok(mut fds) => match fds.pop() {
                    Some(fd) => UnixStream::from(fd),
                    None => return Err(RunnerError::Protocol("No client connection received".into())),
                },
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    info!("Dispatcher closed the control channel. Exiting.");
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            };

            match self.handle_client(sync, client) {
                Next::Continue => (&self.control).write_all(&[JOB_DONE])?,
                Next::Retire(code) => return Ok(code),
                Next::Fatal(e) => return Err(e),
            }
        }
    }

    /// Run the job on `client` and send its status byte, which is always the
    /// last thing written to the connection.
    fn handle_client(&mut self, sync: &JobSync, client: UnixStream) -> Next {
        let client = Arc::new(client);
        let (status, next) = self.process_job(sync, &client);
        if let Err(e) = (&*client).write_all(&[status]) {
            debug!("Could not send status {} to client: {}", status, e);
        }
        next
    }

    fn process_job(&mut self, sync: &JobSync, client: &Arc<UnixStream>) -> (u8, Next) {
        let mut request = match JobRequest::receive(client) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to receive job: {}", e);
                return (e.status_byte(), Next::Continue);
            }
        };
        let Some(guard) = sync.begin_job(Arc::clone(client)) else {
            return (
                exit_code::FAILURE,
                Next::Fatal(RunnerError::Worker("Connection watcher is gone".into())),
            );
        };

        let result = self.execute(&mut request, guard.cancel_token());
        if let Err(e) = &result {
            report_failure(&request, e);
        }
        // End the job before the client's streams close and stdio is restored.
        drop(guard);
        drop(request);

        match result {
            Ok(()) => (exit_code::SUCCESS, Next::Continue),
            Err(e) if e.is_fatal() => (exit_code::FAILURE, Next::Fatal(e)),
            Err(RunnerError::JobAborted) if !self.component.reusable_after_abort() => {
                info!("Component cannot be reused after an aborted job. Executor process exiting.");
                (exit_code::ABORTED, Next::Retire(RETIRED_AFTER_ABORT))
            }
            Err(e) => (e.status_byte(), Next::Continue),
        }
    }

    fn execute(&mut self, request: &mut JobRequest, cancel: &CancelToken) -> Result<()> {
        request.redirect_logs()?;
        let args = match JobArgs::parse_argv(&request.argv)? {
            ParsedJob::Run(args) => args,
            ParsedJob::Help(text) => {
                (&request.stdout).write_all(text.as_bytes())?;
                return Ok(());
            }
        };
        let _verbosity = self.log.job_verbosity(args.verbose);
        debug!(argv = ?request.argv, cwd = %request.cwd.display(), "Received job");
        job::run(
            &args,
            ClientContext::from_request(request),
            &mut self.component,
            cancel,
        )
    }
}

/// Tell the client why its job failed. Usage errors are printed as rendered.
fn report_failure(request: &JobRequest, err: &RunnerError) {
    match err {
        RunnerError::Usage(text) => {
            let _ = (&request.stderr).write_all(text.as_bytes());
        }
        RunnerError::JobAborted => warn!("{}", err),
        _ => error!("{}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_code_matches_abort_status() {
        assert_eq!(RETIRED_AFTER_ABORT, 3);
    }

    #[test]
    fn test_default_config_idles_out() {
        assert!(WorkerConfig::default().idle_timeout.is_enabled());
    }
}
