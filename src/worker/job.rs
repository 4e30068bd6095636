//! Running one job: argument parsing, media inspection and result output.

use super::output::{self, FrameClock, JobOutput, JobSummary};
use super::request::JobRequest;
use crate::component::{CancelToken, ComponentHandle, Descriptor, Job, MediaKind};
use crate::error::{Result, RunnerError};
use crate::paths::{STDIO_PATH, proc_fd_path, resolve_input, resolve_output};
use crate::protocol::job_props_from_env;
use chrono::Local;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Program name clients put in `argv[0]`.
pub const PROGRAM_NAME: &str = "comprunner run";

/// Metadata entry holding the media's MIME type.
const MIME_TYPE_KEY: &str = "MIME_TYPE";

/// Extensions the platform MIME database commonly lacks or gets wrong, plus
/// the common media formats.
const MIME_TYPES: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("webp", "image/webp"),
    ("mp4", "video/mp4"),
    ("m4v", "video/x-m4v"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("ogg", "video/ogg"),
    ("mpg", "video/mpeg"),
    ("mpeg", "video/mpeg"),
    ("wmv", "video/x-ms-wmv"),
    ("flv", "video/x-flv"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/x-wav"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("oga", "audio/ogg"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xml", "text/xml"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
];

/// Command line of a job, as typed after `comprunner run`.
#[derive(Parser, Debug)]
#[command(
    name = PROGRAM_NAME,
    about = "Run a component on a piece of media",
    disable_version_flag = true,
    allow_negative_numbers = true
)]
pub struct JobArgs {
    /// Path to media to process. To read from standard in use "-"
    pub media_path: String,

    /// Type of media. Required when reading media from standard in, otherwise
    /// guessed from the file extension
    #[arg(short = 't', long, value_enum, ignore_case = true)]
    pub media_type: Option<MediaKind>,

    /// Set a job property (e.g. "-P ROTATION=90"). May be repeated
    #[arg(short = 'P', long = "job-prop", value_name = "NAME=VALUE", value_parser = parse_key_val)]
    pub job_props: Vec<(String, String)>,

    /// Set a media metadata value (e.g. "-M FPS=29.97"). May be repeated
    #[arg(short = 'M', long, value_name = "NAME=VALUE", value_parser = parse_key_val)]
    pub media_metadata: Vec<(String, String)>,

    /// First frame of a video (or millisecond of audio) to process
    #[arg(short, long, default_value_t = 0)]
    pub begin: i64,

    /// Last frame of a video (or millisecond of audio) to process; -1 for the end
    #[arg(short, long, default_value_t = -1)]
    pub end: i64,

    /// Pretty print JSON output
    #[arg(short, long)]
    pub pretty: bool,

    /// Only output tracks
    #[arg(long)]
    pub brief: bool,

    /// Where to write the JSON output. Defaults to standard out
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Descriptor to use when several components are installed
    #[arg(long, value_name = "PATH")]
    pub descriptor: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Result of parsing a job command line.
#[derive(Debug)]
pub enum ParsedJob {
    Run(Box<JobArgs>),
    /// `--help` was requested; the text goes to the client's stdout.
    Help(String),
}

impl JobArgs {
    /// Parse a full argv (program name first).
    ///
    /// Malformed command lines become [`RunnerError::Usage`] carrying the
    /// rendered message and usage.
    pub fn parse_argv(argv: &[String]) -> Result<ParsedJob> {
        let args = match Self::try_parse_from(argv) {
            Ok(args) => args,
            Err(e) => {
                return match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                        Ok(ParsedJob::Help(e.render().to_string()))
                    }
                    _ => Err(RunnerError::Usage(e.render().to_string())),
                };
            }
        };
        if args.media_path == STDIO_PATH && args.media_type.is_none() {
            let err = Self::command().error(
                ErrorKind::MissingRequiredArgument,
                "When reading from standard in --media-type/-t must be provided.",
            );
            return Err(RunnerError::Usage(err.render().to_string()));
        }
        Ok(ParsedJob::Run(Box::new(args)))
    }
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid NAME=VALUE: no `=` found in `{}`", s))
}

/// The component a worker loads on its first job and keeps.
#[derive(Debug, Default)]
pub struct ComponentSlot {
    loaded: Option<(Descriptor, ComponentHandle)>,
    /// Where a plugin process sends its stderr.
    diagnostics: Option<OwnedFd>,
}

impl ComponentSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// A slot whose plugin writes diagnostics to `fd` instead of the stderr
    /// of the job that happens to load it.
    pub fn with_diagnostics(fd: OwnedFd) -> Self {
        Self {
            loaded: None,
            diagnostics: Some(fd),
        }
    }

    /// The loaded component, loading it from `descriptor` (or the installed
    /// one) on first use.
    pub fn get_or_load(
        &mut self,
        descriptor: Option<&Path>,
    ) -> Result<&mut (Descriptor, ComponentHandle)> {
        let loaded = match self.loaded.take() {
            Some(loaded) => loaded,
            None => {
                let descriptor = Descriptor::locate(descriptor)?;
                let component = ComponentHandle::load(
                    &descriptor,
                    self.diagnostics.as_ref().map(|fd| fd.as_fd()),
                )?;
                info!(
                    "Loaded {} component {}",
                    descriptor.source_language, descriptor.component_name
                );
                (descriptor, component)
            }
        };
        Ok(self.loaded.insert(loaded))
    }

    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Whether another job may run after one was aborted.
    pub fn reusable_after_abort(&self) -> bool {
        self.loaded
            .as_ref()
            .is_none_or(|(_, component)| component.reusable_after_abort())
    }
}

/// What a job needs from the client besides its arguments.
#[derive(Debug, Clone, Copy)]
pub struct ClientContext<'a> {
    pub cwd: &'a Path,
    pub env_props: &'a BTreeMap<String, String>,
    pub stdin: RawFd,
    pub stdout: &'a File,
}

impl<'a> ClientContext<'a> {
    pub fn from_request(request: &'a JobRequest) -> Self {
        Self {
            cwd: &request.cwd,
            env_props: &request.env_props,
            stdin: request.stdin.as_raw_fd(),
            stdout: &request.stdout,
        }
    }
}

/// Run one job to completion and write its results.
pub fn run(
    args: &JobArgs,
    client: ClientContext<'_>,
    slot: &mut ComponentSlot,
    cancel: &CancelToken,
) -> Result<()> {
    let started = Local::now();
    let media_arg = resolve_input(&args.media_path, client.cwd);
    let mut output_file = open_output(args.output.as_deref(), client.cwd)?;

    let descriptor_path = args.descriptor.as_ref().map(|p| resolve_input(p, client.cwd));
    let (descriptor, component) = slot.get_or_load(descriptor_path.as_deref())?;

    let mut metadata: BTreeMap<String, String> = args.media_metadata.iter().cloned().collect();
    let mime_type = guess_mime_type(args.media_type, &media_arg, &mut metadata)?;
    let kind = media_kind(args.media_type, &mime_type)?;
    if !component.supports(kind) {
        return Err(RunnerError::Job(format!(
            "The component does not support {} jobs.",
            kind.as_str().to_lowercase()
        )));
    }

    let media_path = media_path(media_arg, client.stdin)?;
    let job_properties = merge_job_props(
        &args.job_props,
        client.env_props,
        job_props_from_env(descriptor.environment()),
        descriptor.property_defaults(),
    );
    let track_type = component.track_type().to_string();

    let job = Job {
        name: media_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| media_path.display().to_string()),
        media_path,
        media_kind: kind,
        begin: args.begin,
        end: args.end,
        job_properties,
        media_metadata: metadata,
    };
    debug!(job = %job.name, kind = %kind, mime_type = %mime_type, "Starting job");

    let mut tracks = Vec::new();
    for track in component.run(&job, cancel)? {
        cancel.check()?;
        tracks.push(track?);
    }
    cancel.check()?;

    let clock = FrameClock::for_media(kind, &job.media_metadata);
    let records = output::to_records(tracks, &track_type, clock);
    info!("{}", output::summary(kind, &records));

    let write = |writer: &mut dyn Write| -> Result<()> {
        if args.brief {
            output::write_json(writer, &records, args.pretty)
        } else {
            let summary = JobSummary {
                started,
                media_path: job.media_path.display().to_string(),
                mime_type,
                track_type,
                job_properties: job.job_properties,
                media_metadata: job.media_metadata,
            };
            output::write_json(writer, &JobOutput::new(summary, records), args.pretty)
        }
    };
    match output_file.as_mut() {
        Some(file) => write(file),
        None => write(&mut &*client.stdout),
    }
}

fn open_output(path: Option<&Path>, cwd: &Path) -> Result<Option<File>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let path = resolve_output(path, cwd);
    if path == Path::new(STDIO_PATH) {
        return Ok(None);
    }
    File::create(&path).map(Some).map_err(|e| {
        RunnerError::Job(format!(
            "Unable to open output file \"{}\": {}",
            path.display(),
            e
        ))
    })
}

/// Where the component reads the media from; `-` becomes the client's stdin.
fn media_path(path: PathBuf, stdin: RawFd) -> Result<PathBuf> {
    if path == Path::new(STDIO_PATH) {
        return Ok(proc_fd_path(std::process::id(), stdin));
    }
    if !path.exists() {
        return Err(RunnerError::Job(format!(
            "The provided media path, \"{}\", does not exist.",
            path.display()
        )));
    }
    Ok(path)
}

/// MIME type for a file name, from its extension.
pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    MIME_TYPES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, mime)| *mime)
}

/// Determine the media's MIME type and record it in `metadata`.
///
/// An explicit `MIME_TYPE` metadata entry wins, then the file extension. If
/// neither is known but the media type was given, a placeholder is used.
pub fn guess_mime_type(
    given: Option<MediaKind>,
    path: &Path,
    metadata: &mut BTreeMap<String, String>,
) -> Result<String> {
    if let Some(mime) = metadata.get(MIME_TYPE_KEY).filter(|m| !m.is_empty()) {
        return Ok(mime.clone());
    }
    if let Some(mime) = mime_from_extension(path) {
        metadata.insert(MIME_TYPE_KEY.to_string(), mime.to_string());
        return Ok(mime.to_string());
    }
    match given {
        Some(kind) => {
            let mime = format!("{}/octet-stream", kind.as_str().to_lowercase());
            warn!(
                "Unable to determine mime type. Using the bogus mime type: {}. \
                 To set it correctly add \"-M MIME_TYPE=<actual mime type>\" on the command line.",
                mime
            );
            Ok(mime)
        }
        None => Err(RunnerError::Job(
            "Unable to determine file type. It must be explicitly provided with the \
             --media-type/-t argument."
                .into(),
        )),
    }
}

/// The given media kind, or one guessed from the MIME type.
pub fn media_kind(given: Option<MediaKind>, mime_type: &str) -> Result<MediaKind> {
    if let Some(kind) = given {
        return Ok(kind);
    }
    warn!("Media type argument missing. Attempting to guess file type...");
    let kind = MediaKind::from_mime(mime_type).ok_or_else(|| {
        RunnerError::Job(format!(
            "Unable to determine job type from mime type ({}). It must be explicitly \
             provided with the --media-type/-t argument.",
            mime_type
        ))
    })?;
    warn!(
        "Guessed that this is a {} job because the mime type was {}.",
        kind.as_str().to_lowercase(),
        mime_type
    );
    Ok(kind)
}

/// Combine job properties. Earlier sources win: the command line, then the
/// client's environment, then the worker's environment, then descriptor defaults.
pub fn merge_job_props<'d>(
    cli: &[(String, String)],
    client_env: &BTreeMap<String, String>,
    worker_env: impl IntoIterator<Item = (String, String)>,
    defaults: impl IntoIterator<Item = (&'d str, &'d str)>,
) -> BTreeMap<String, String> {
    let mut props: BTreeMap<String, String> = cli.iter().cloned().collect();
    for (k, v) in client_env {
        props.entry(k.clone()).or_insert_with(|| v.clone());
    }
    for (k, v) in worker_env {
        props.entry(k).or_insert(v);
    }
    for (k, v) in defaults {
        props.entry(k.to_string()).or_insert_with(|| v.to_string());
    }
    props
}
