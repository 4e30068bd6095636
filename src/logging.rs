//! Logging setup for the client, the dispatcher and worker processes.
//!
//! Dispatchers and workers log to whatever fd 2 currently is. A detached
//! dispatcher points it at its log file, and workers temporarily point it at
//! the client's stderr while a job runs, so job logs reach whoever submitted
//! the job. A job's `-v` flags raise the verbosity through [`LogHandle`] for
//! the duration of that job only.
//!
//! # Environment Variables
//!
//! - `COMPRUNNER_LOG` - Log filter (overrides RUST_LOG)
//! - `COMPRUNNER_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `COMPRUNNER_LOG_FORMAT` - Output format: pretty, compact, json
//! - `COMPRUNNER_LOG_FILE` - Also append logs to this file
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use comprunner::logging::{LogConfig, init};
//!
//! let handle = init(LogConfig::for_worker().with_env_overrides());
//! {
//!     let _verbose = handle.job_verbosity(1);
//!     tracing::debug!("visible while the job runs");
//! }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::{Layered, SubscriberExt},
    reload,
    util::SubscriberInitExt,
};

const LOG_FILTER_ENV: &str = "COMPRUNNER_LOG";
const LOG_LEVEL_ENV: &str = "COMPRUNNER_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "COMPRUNNER_LOG_FORMAT";
const LOG_FILE_ENV: &str = "COMPRUNNER_LOG_FILE";

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-readable
    Pretty,
    /// One line per event (default)
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
///
/// Start from the preset for the process role, adjust, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level used when no filter is set
    pub level: Level,
    pub format: LogFormat,
    /// Extra file to append logs to
    pub file_path: Option<PathBuf>,
    /// Filter directives; overrides `level`
    pub filter: Option<String>,
    /// Colorize stderr output
    pub ansi: bool,
    pub show_target: bool,
    pub show_line_numbers: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            file_path: None,
            filter: None,
            ansi: false,
            show_target: false,
            show_line_numbers: false,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the job-submitting client: only problems, colored on a terminal.
    pub fn for_client() -> Self {
        use std::io::IsTerminal;
        Self {
            level: Level::WARN,
            ansi: std::io::stderr().is_terminal(),
            ..Self::default()
        }
    }

    /// Preset for the dispatcher. Its stderr is usually a log file.
    pub fn for_server() -> Self {
        Self {
            level: Level::DEBUG,
            show_target: true,
            ..Self::default()
        }
    }

    /// Preset for worker processes. Their stderr is a log file or a client's stderr.
    pub fn for_worker() -> Self {
        Self {
            show_line_numbers: true,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Raise the level for each `-v` given on the command line.
    pub fn with_verbosity(self, verbose: u8) -> Self {
        match verbose {
            0 => self,
            1 => self.with_filter("debug".to_string()),
            _ => self.with_filter("trace".to_string()),
        }
    }

    /// Apply environment variable overrides.
    ///
    /// A filter from `-v` wins over `COMPRUNNER_LOG`, `RUST_LOG` and
    /// `COMPRUNNER_LOG_LEVEL`. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            self.filter = std::env::var(LOG_FILTER_ENV)
                .or_else(|_| std::env::var("RUST_LOG"))
                .ok();
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var(LOG_LEVEL_ENV)
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var(LOG_FORMAT_ENV)
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var(LOG_FILE_ENV)
            && !path.is_empty()
        {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    /// The filter directive string this configuration resolves to.
    fn filter_directives(&self) -> String {
        match self.filter {
            Some(ref filter) if EnvFilter::try_new(filter).is_ok() => filter.clone(),
            Some(ref filter) => {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                level_directive(self.level)
            }
            None => level_directive(self.level),
        }
    }
}

fn level_directive(level: Level) -> String {
    level.to_string().to_lowercase()
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" | "fatal" | "critical" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type FilteredRegistry = Layered<reload::Layer<EnvFilter, Registry>, Registry>;
type BoxedLayer = Box<dyn Layer<FilteredRegistry> + Send + Sync>;

fn format_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.show_target)
        .with_line_number(config.show_line_numbers);
    match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    }
}

/// Handle to the installed subscriber's filter.
#[derive(Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    base: String,
}

impl LogHandle {
    /// Temporarily raise verbosity for a job: `1` = debug, `2+` = trace.
    ///
    /// The previous filter comes back when the guard is dropped. Returns `None`
    /// when `verbose` is 0 and nothing changes.
    pub fn job_verbosity(&self, verbose: u8) -> Option<VerbosityGuard> {
        let directive = match verbose {
            0 => return None,
            1 => "debug",
            _ => "trace",
        };
        if let Err(e) = self.filter.reload(EnvFilter::new(directive)) {
            tracing::debug!("Could not change log level: {}", e);
            return None;
        }
        Some(VerbosityGuard {
            handle: self.clone(),
        })
    }
}

/// Restores the base log filter on drop.
pub struct VerbosityGuard {
    handle: LogHandle,
}

impl Drop for VerbosityGuard {
    fn drop(&mut self) {
        let _ = self
            .handle
            .filter
            .reload(EnvFilter::new(&self.handle.base));
    }
}

/// Install the global tracing subscriber.
///
/// Logs go to stderr and, when `config.file_path` is set, are appended to that
/// file as well. Later calls keep the first subscriber; the handle they
/// return then has no effect.
pub fn init(config: LogConfig) -> LogHandle {
    let base = config.filter_directives();
    let (filter_layer, filter) = reload::Layer::new(EnvFilter::new(&base));

    let mut layers: Vec<BoxedLayer> = vec![format_layer(&config, std::io::stderr, config.ansi)];
    if let Some(path) = config.file_path.as_ref() {
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("comprunner.log");
        layers.push(format_layer(
            &config,
            tracing_appender::rolling::never(dir, file_name),
            false,
        ));
    }

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(layers)
        .try_init();

    LogHandle { filter, base }
}
