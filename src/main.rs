//! comprunner - component job runner

use anyhow::{Context, Result};
use clap::Parser;
use comprunner::cli::{Cli, Commands, RunArgs, ServeArgs, WorkerArgs};
use comprunner::client;
use comprunner::error::RunnerError;
use comprunner::logging::{self, LogConfig};
use comprunner::protocol::{ServerStartup, exit_code};
use comprunner::server::{self, Dispatcher, DispatcherConfig, WorkerCommand};
use comprunner::worker::{self, WorkerConfig};
use owo_colors::{OwoColorize, Stream::Stderr};
use std::io::Write;
use tracing::{info, warn};

fn main() {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Serve(args) => cmd_serve(&cli, args),
        Commands::Worker(args) => cmd_worker(&cli, args),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            std::process::exit(1);
        }
    }
}

/// Submit a job and exit with the status byte the worker sent back.
fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<i32> {
    logging::init(
        LogConfig::for_client()
            .with_verbosity(cli.verbose)
            .with_env_overrides(),
    );

    match client::run_job(&cli.socket, &args.args) {
        Ok(status) => Ok(i32::from(status)),
        Err(RunnerError::ServerDied) => {
            eprintln!("ERROR: Server closed connection before completing the job.");
            Ok(i32::from(exit_code::SERVER_DIED))
        }
        Err(e) => Err(e).context("Failed to run job"),
    }
}

/// Run the dispatcher until it idles out or is interrupted.
fn cmd_serve(cli: &Cli, args: &ServeArgs) -> Result<i32> {
    let config = DispatcherConfig {
        socket_name: cli.socket.clone(),
        idle_timeout: args.effective_idle_timeout(),
        worker_idle_timeout: args.effective_worker_idle_timeout(),
        worker_command: WorkerCommand::current_exe()?,
    };

    let mut dispatcher = if args.detach {
        match bind_detached(config)? {
            Some(dispatcher) => dispatcher,
            None => return Ok(0),
        }
    } else {
        Dispatcher::bind(config).context("Failed to start server")?
    };

    logging::init(
        LogConfig::for_server()
            .with_verbosity(cli.verbose)
            .with_env_overrides(),
    );

    let shutdown = dispatcher.shutdown_handle();
    if let Err(e) = ctrlc::set_handler(move || shutdown.trigger()) {
        warn!("Failed to install signal handler: {}", e);
    }

    let stats = dispatcher.serve()?;
    info!("{}", stats);
    Ok(0)
}

/// Bind, report the outcome to the starting client on stdout, then detach.
///
/// Returns `None` when another dispatcher already owns the socket.
fn bind_detached(config: DispatcherConfig) -> Result<Option<Dispatcher>> {
    let dispatcher = match Dispatcher::bind(config) {
        Ok(dispatcher) => dispatcher,
        Err(RunnerError::AddressInUse(_)) => {
            report_startup(&ServerStartup::AddressInUse)?;
            return Ok(None);
        }
        Err(e) => {
            report_startup(&ServerStartup::error(e.to_string()))?;
            return Err(e).context("Failed to start server");
        }
    };

    report_startup(&ServerStartup::Ready {
        pid: std::process::id(),
    })?;
    let log_path = server::server_log_path();
    server::detach_stdio(&log_path)
        .with_context(|| format!("Failed to detach server {}", dispatcher.socket_name()))?;
    Ok(Some(dispatcher))
}

fn report_startup(startup: &ServerStartup) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(startup.to_line()?.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Worker process: run jobs handed over on stdin until idle or orphaned.
fn cmd_worker(cli: &Cli, args: &WorkerArgs) -> Result<i32> {
    let log = logging::init(
        LogConfig::for_worker()
            .with_verbosity(cli.verbose)
            .with_env_overrides(),
    );
    let config = WorkerConfig {
        idle_timeout: args.idle_timeout,
    };
    worker::run_worker(config, log).context("Worker failed")
}
