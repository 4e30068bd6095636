//! Components running as a persistent external plugin process.
//!
//! The descriptor's `batchLibrary` names an executable (relative paths resolve
//! against the descriptor's directory). It is started once per worker, with
//! stdin/stdout piped for the line protocol in [`super::protocol`] and the
//! descriptor's `environmentVariables` set.
//!
//! The plugin outlives the job that started it, so its stderr must never be a
//! client's stream: it goes to the descriptor the worker hands in (the
//! worker's own log) or to `/dev/null`.
//!
//! A cancelled job leaves the plugin mid-response, so the plugin is killed and
//! the component cannot be reused.

use super::protocol::{PluginRequest, PluginResponse};
use super::{CancelToken, Descriptor, Job, MediaKind, Track, TrackIter};
use crate::error::{Result, RunnerError};
use crate::ipc::{LineReader, LineWriter, PipeFd, poll_readable};
use crate::process::ChildProcess;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

/// How often a job waiting on the plugin re-checks for cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Grace period for a plugin to exit after the exit request.
const EXIT_GRACE: Duration = Duration::from_millis(500);

pub struct SubprocessComponent {
    name: String,
    track_type: String,
    media_types: Vec<MediaKind>,
    process: ChildProcess,
    writer: LineWriter<PipeFd>,
    reader: LineReader<PipeFd>,
    /// Set once the plugin is dead or its stream is out of sync.
    broken: bool,
}

impl std::fmt::Debug for SubprocessComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessComponent")
            .field("name", &self.name)
            .field("pid", &self.process.pid())
            .field("media_types", &self.media_types)
            .field("broken", &self.broken)
            .finish()
    }
}

impl SubprocessComponent {
    /// Launch the plugin and wait for its `ready` message.
    pub fn start(descriptor: &Descriptor, diagnostics: Option<BorrowedFd<'_>>) -> Result<Self> {
        let library = PathBuf::from(descriptor.batch_library()?);
        let program = if library.is_absolute() {
            library
        } else {
            descriptor.directory().join(library)
        };
        let stderr = match diagnostics {
            Some(fd) => Stdio::from(fd.try_clone_to_owned()?),
            None => Stdio::null(),
        };

        let mut child = Command::new(&program)
            .current_dir(descriptor.directory())
            .envs(descriptor.environment_overrides())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                RunnerError::ComponentInit(format!(
                    "Failed to start plugin {}: {}",
                    program.display(),
                    e
                ))
            })?;
        let process = ChildProcess::from_child(&child);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::ComponentInit("Plugin stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::ComponentInit("Plugin stdout not captured".into()))?;

        let mut component = Self {
            name: descriptor.component_name.clone(),
            track_type: descriptor.track_type()?.to_string(),
            media_types: Vec::new(),
            process,
            writer: LineWriter::new(PipeFd::from(stdin)),
            reader: LineReader::new(PipeFd::from(stdout)),
            broken: false,
        };

        match component.reader.read_message::<PluginResponse>("plugin ready message") {
            Ok(PluginResponse::Ready { media_types }) => component.media_types = media_types,
            Ok(other) => {
                return Err(RunnerError::ComponentInit(format!(
                    "Plugin {} sent {:?} instead of ready",
                    component.name, other
                )));
            }
            Err(e) => {
                let status = component.process.wait_timeout(EXIT_GRACE).ok().flatten();
                return Err(RunnerError::ComponentInit(match status {
                    Some(status) => format!("Plugin {} {} during startup", component.name, status),
                    None => format!("Plugin {} failed to start: {}", component.name, e),
                }));
            }
        }

        tracing::debug!(
            component = %component.name,
            pid = component.process.pid().as_raw(),
            media_types = ?component.media_types,
            "Plugin ready"
        );
        Ok(component)
    }

    /// A plugin that declares no media types accepts all of them.
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.media_types.is_empty() || self.media_types.contains(&kind)
    }

    pub fn track_type(&self) -> &str {
        &self.track_type
    }

    pub fn run<'a>(&'a mut self, job: &'a Job, cancel: &'a CancelToken) -> Result<TrackIter<'a>> {
        if self.broken || !self.process.is_running() {
            self.broken = true;
            return Err(RunnerError::Worker(format!(
                "Plugin {} is no longer running",
                self.name
            )));
        }
        if let Err(e) = self.writer.write_message(&PluginRequest::job(job.clone())) {
            self.broken = true;
            return Err(RunnerError::Worker(format!(
                "Failed to send job to plugin {}: {}",
                self.name, e
            )));
        }
        Ok(Box::new(PluginTracks {
            component: self,
            cancel,
            finished: false,
        }))
    }

    /// Kill the plugin; its output stream can no longer be trusted.
    fn abort(&mut self) {
        self.broken = true;
        if let Err(e) = self.process.kill() {
            tracing::warn!("Failed to kill plugin {}: {}", self.name, e);
        }
        let _ = self.process.wait();
    }

    /// Block until the plugin has output or `cancel` fires.
    fn wait_readable(&mut self, cancel: &CancelToken) -> Result<()> {
        if self.reader.has_buffered_data() {
            return Ok(());
        }
        loop {
            cancel.check()?;
            let fd = self.reader.get_ref().as_fd();
            if !poll_readable(&[fd], Some(CANCEL_POLL_INTERVAL))?.is_empty() {
                return Ok(());
            }
        }
    }

    fn next_response(&mut self, cancel: &CancelToken) -> Result<PluginResponse> {
        self.wait_readable(cancel)?;
        self.reader
            .read_message("plugin response")
            .map_err(|e| match self.process.wait_timeout(Duration::ZERO) {
                Ok(Some(status)) => {
                    RunnerError::Worker(format!("Plugin {} {}", self.name, status))
                }
                _ => e,
            })
    }
}

impl Drop for SubprocessComponent {
    fn drop(&mut self) {
        if !self.broken {
            let _ = self.writer.write_message(&PluginRequest::Exit);
        }
        if let Err(e) = self.process.stop(EXIT_GRACE) {
            tracing::warn!("Failed to stop plugin {}: {}", self.name, e);
        }
    }
}

/// Tracks streamed from the plugin for one job.
struct PluginTracks<'a> {
    component: &'a mut SubprocessComponent,
    cancel: &'a CancelToken,
    finished: bool,
}

impl Iterator for PluginTracks<'_> {
    type Item = Result<Track>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let outcome = match self.component.next_response(self.cancel) {
            Ok(PluginResponse::Track { track }) => return Some(Ok(track)),
            Ok(PluginResponse::Done) => None,
            Ok(PluginResponse::Error { message }) => Some(Err(RunnerError::Job(message))),
            Ok(PluginResponse::Ready { .. }) => {
                self.component.broken = true;
                Some(Err(RunnerError::Protocol(
                    "Plugin sent ready in the middle of a job".into(),
                )))
            }
            Err(RunnerError::JobAborted) => {
                self.component.abort();
                Some(Err(RunnerError::JobAborted))
            }
            Err(e) => {
                self.component.broken = true;
                Some(Err(e))
            }
        };
        self.finished = true;
        outcome
    }
}

impl Drop for PluginTracks<'_> {
    fn drop(&mut self) {
        // Unread responses would be mistaken for the next job's.
        if !self.finished {
            self.component.abort();
        }
    }
}
