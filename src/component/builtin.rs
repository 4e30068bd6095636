//! Components compiled into the runner binary.
//!
//! Selected by the descriptor's `batchLibrary`:
//!
//! - `echo`: one track per non-empty line of a text file
//! - `delay`: waits `DELAY_MS` milliseconds, then reports a single track
//!
//! Both are cheap stand-ins for real analytics and are what the test suite
//! drives end to end.

use super::{CancelToken, Descriptor, Detection, Job, MediaKind, Track, TrackIter};
use crate::error::{Result, RunnerError};
use std::collections::BTreeMap;
use std::fs;
use std::time::{Duration, Instant};

/// Default for the `delay` component's `DELAY_MS` property.
pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Granularity at which a sleeping job notices cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Echo,
    Delay,
}

impl BuiltinKind {
    pub fn from_library(name: &str) -> Option<Self> {
        match name {
            "echo" => Some(Self::Echo),
            "delay" => Some(Self::Delay),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct BuiltinComponent {
    kind: BuiltinKind,
    track_type: String,
}

impl BuiltinComponent {
    pub fn load(descriptor: &Descriptor) -> Result<Self> {
        let library = descriptor.batch_library()?;
        let kind = BuiltinKind::from_library(library.trim()).ok_or_else(|| {
            RunnerError::ComponentInit(format!("No builtin component named \"{}\"", library))
        })?;
        Ok(Self {
            kind,
            track_type: descriptor.track_type()?.to_string(),
        })
    }

    pub fn kind(&self) -> BuiltinKind {
        self.kind
    }

    pub fn supports(&self, media: MediaKind) -> bool {
        match self.kind {
            BuiltinKind::Echo => media == MediaKind::Generic,
            BuiltinKind::Delay => true,
        }
    }

    pub fn track_type(&self) -> &str {
        &self.track_type
    }

    pub fn run<'a>(&'a mut self, job: &'a Job, cancel: &'a CancelToken) -> Result<TrackIter<'a>> {
        match self.kind {
            BuiltinKind::Echo => run_echo(job, cancel),
            BuiltinKind::Delay => Ok(run_delay(job, cancel)),
        }
    }
}

fn run_echo<'a>(job: &'a Job, cancel: &'a CancelToken) -> Result<TrackIter<'a>> {
    let bytes = fs::read(&job.media_path).map_err(|e| {
        RunnerError::Job(format!(
            "Failed to read {}: {}",
            job.media_path.display(),
            e
        ))
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let prefix = job.job_properties.get("PREFIX").cloned().unwrap_or_default();

    Ok(Box::new(lines.into_iter().enumerate().map(
        move |(index, line)| {
            cancel.check()?;
            let text = format!("{}{}", prefix, line);
            Ok(Track {
                confidence: 1.0,
                properties: BTreeMap::from([
                    ("LINE".to_string(), (index + 1).to_string()),
                    ("TEXT".to_string(), text.clone()),
                ]),
                detections: vec![Detection {
                    confidence: 1.0,
                    properties: BTreeMap::from([("TEXT".to_string(), text)]),
                    ..Default::default()
                }],
                ..Default::default()
            })
        },
    )))
}

fn run_delay<'a>(job: &'a Job, cancel: &'a CancelToken) -> TrackIter<'a> {
    let delay = Duration::from_millis(job.property_or("DELAY_MS", DEFAULT_DELAY_MS));
    Box::new(std::iter::once_with(move || {
        sleep_unless_cancelled(delay, cancel)?;
        let start_frame = job.begin.max(0);
        let stop_frame = if job.end >= start_frame {
            job.end
        } else {
            start_frame
        };
        Ok(Track {
            start_frame,
            stop_frame,
            confidence: 1.0,
            properties: BTreeMap::from([(
                "DELAY_MS".to_string(),
                delay.as_millis().to_string(),
            )]),
            detections: vec![Detection {
                frame: start_frame,
                confidence: 1.0,
                ..Default::default()
            }],
        })
    }))
}

/// Sleep for `total`, returning `Err(JobAborted)` as soon as `cancel` fires.
fn sleep_unless_cancelled(total: Duration, cancel: &CancelToken) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
    }
}
