//! Command-line interface definitions using clap.

use crate::config::{
    DEFAULT_SOCKET_NAME, IDLE_TIMEOUT_ENV, IdleTimeout, SOCKET_ENV, WORKER_IDLE_TIMEOUT_ENV,
};
use clap::{Parser, Subcommand};

/// Run analytic components on media without paying their startup cost per job.
#[derive(Parser, Debug)]
#[command(name = "comprunner")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Abstract socket name of the dispatcher.
    #[arg(long, env = SOCKET_ENV, default_value = DEFAULT_SOCKET_NAME)]
    pub socket: String,

    /// Enable verbose logging for this process (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job, starting a dispatcher in the background if none is running.
    ///
    /// Everything after `run` is passed to the job unchanged; see
    /// `comprunner run --help` for the job options.
    #[command(disable_help_flag = true)]
    Run(RunArgs),

    /// Run the dispatcher in the foreground.
    Serve(ServeArgs),

    /// Worker process started by the dispatcher.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    pub args: Vec<String>,
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Seconds without jobs or workers before exiting; 0 or less never exits.
    /// Defaults to never in the foreground and 60 seconds when detached.
    #[arg(long, env = IDLE_TIMEOUT_ENV, allow_hyphen_values = true)]
    pub idle_timeout: Option<IdleTimeout>,

    /// Seconds a worker waits for a job before exiting; 0 or less never exits.
    /// Defaults to the dispatcher's idle timeout.
    #[arg(long, env = WORKER_IDLE_TIMEOUT_ENV, allow_hyphen_values = true)]
    pub worker_idle_timeout: Option<IdleTimeout>,

    /// Report readiness on stdout, then log to a file and detach from the terminal.
    #[arg(long, hide = true)]
    pub detach: bool,
}

impl ServeArgs {
    /// The dispatcher's idle timeout, applying the mode-dependent default.
    pub fn effective_idle_timeout(&self) -> IdleTimeout {
        match self.idle_timeout {
            Some(timeout) => timeout,
            None if self.detach => IdleTimeout::default(),
            None => IdleTimeout::DISABLED,
        }
    }

    /// The idle timeout passed to each worker.
    pub fn effective_worker_idle_timeout(&self) -> IdleTimeout {
        self.worker_idle_timeout
            .unwrap_or_else(|| self.effective_idle_timeout())
    }
}

/// Arguments for the worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Seconds without a job before the worker exits; 0 or less never exits.
    #[arg(long, allow_hyphen_values = true, default_value_t = IdleTimeout::default())]
    pub idle_timeout: IdleTimeout,
}
