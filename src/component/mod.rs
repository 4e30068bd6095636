//! Analytic components and the jobs they run.
//!
//! A worker resolves its component once, from the descriptor's
//! `sourceLanguage`, into a [`ComponentHandle`]. The handle is a closed set of
//! variants with the same capabilities:
//!
//! - `supports`: whether a media kind can be processed
//! - `run`: a lazy sequence of tracks for one job
//! - `track_type`: the type name reported in results
//! - `reusable_after_abort`: whether the component survives a cancelled job

pub mod builtin;
pub mod descriptor;
pub mod protocol;
pub mod subprocess;

use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::io::BorrowedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use builtin::BuiltinComponent;
pub use descriptor::Descriptor;
pub use subprocess::SubprocessComponent;

/// Kind of media a job processes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Generic,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
            Self::Generic => "GENERIC",
        }
    }

    /// Guess the media kind from a MIME type.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mime = mime.to_ascii_lowercase();
        if mime.contains("video") {
            Some(Self::Video)
        } else if mime.contains("image") {
            Some(Self::Image)
        } else if mime.contains("audio") {
            Some(Self::Audio)
        } else if mime.contains("text") || mime.contains("pdf") {
            Some(Self::Generic)
        } else {
            None
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation flag shared between a job and whoever may abort it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(JobAborted)` once cancelled; components call this between units of work.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(RunnerError::JobAborted)
        } else {
            Ok(())
        }
    }
}

/// One job, as handed to a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job name (the media file name).
    pub name: String,
    pub media_path: PathBuf,
    pub media_kind: MediaKind,
    /// First frame (or millisecond for audio) to process.
    pub begin: i64,
    /// Last frame to process; `-1` means the end of the media.
    pub end: i64,
    pub job_properties: BTreeMap<String, String>,
    pub media_metadata: BTreeMap<String, String>,
}

impl Job {
    /// Look up a job property, falling back to `default` when absent or unparsable.
    pub fn property_or<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.job_properties
            .get(name)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// A single detection produced by a component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Detection {
    /// Frame index within the media; 0 for images and generic media.
    pub frame: i64,
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
    pub properties: BTreeMap<String, String>,
}

/// A track: a group of detections across frames (or a single result).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Track {
    pub start_frame: i64,
    pub stop_frame: i64,
    pub confidence: f32,
    pub properties: BTreeMap<String, String>,
    pub detections: Vec<Detection>,
}

/// Lazy sequence of tracks for one job.
pub type TrackIter<'a> = Box<dyn Iterator<Item = Result<Track>> + 'a>;

/// The component loaded by a worker.
#[derive(Debug)]
pub enum ComponentHandle {
    /// Compiled into this binary.
    Builtin(BuiltinComponent),
    /// An external plugin process speaking the line protocol.
    Subprocess(SubprocessComponent),
}

impl ComponentHandle {
    /// Resolve and initialize the component a descriptor names.
    ///
    /// Unknown or unsupported source languages fail with
    /// [`RunnerError::UnsupportedLanguage`]. A plugin process writes its
    /// stderr to `diagnostics`, or nowhere when it is `None`.
    pub fn load(descriptor: &Descriptor, diagnostics: Option<BorrowedFd<'_>>) -> Result<Self> {
        let language = descriptor.source_language.to_lowercase();
        tracing::debug!(
            component = %descriptor.component_name,
            language = %language,
            "Loading component"
        );
        match language.as_str() {
            "builtin" | "rust" => Ok(Self::Builtin(BuiltinComponent::load(descriptor)?)),
            "subprocess" => Ok(Self::Subprocess(SubprocessComponent::start(descriptor, diagnostics)?)),
            _ => Err(RunnerError::UnsupportedLanguage(
                descriptor.source_language.clone(),
            )),
        }
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        match self {
            Self::Builtin(c) => c.supports(kind),
            Self::Subprocess(c) => c.supports(kind),
        }
    }

    /// Start a job. Tracks are produced lazily; each item checks `cancel`.
    pub fn run<'a>(&'a mut self, job: &'a Job, cancel: &'a CancelToken) -> Result<TrackIter<'a>> {
        match self {
            Self::Builtin(c) => c.run(job, cancel),
            Self::Subprocess(c) => c.run(job, cancel),
        }
    }

    pub fn track_type(&self) -> &str {
        match self {
            Self::Builtin(c) => c.track_type(),
            Self::Subprocess(c) => c.track_type(),
        }
    }

    /// Whether the component can take another job after one was cancelled midway.
    pub fn reusable_after_abort(&self) -> bool {
        match self {
            Self::Builtin(_) => true,
            Self::Subprocess(_) => false,
        }
    }
}
