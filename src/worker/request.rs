//! Receiving a job from a client connection.
//!
//! The client sends, in order:
//!
//! 1. one byte plus its stdin, stdout and stderr as `SCM_RIGHTS` descriptors
//! 2. its argv as a JSON list of strings
//! 3. its working directory as a JSON string
//! 4. its `MPF_PROP_*` job properties as a JSON object of strings
//!
//! all on one line each.

use crate::error::{Result, RunnerError};
use crate::ipc::{LineReader, recv_exact_fds};
use crate::protocol::CLIENT_STREAM_COUNT;
use nix::unistd::{dup2_stderr, dup2_stdout};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

/// A received job and the client streams it writes to.
///
/// Fields drop in declaration order: the client's stdin, stdout and stderr
/// are closed before this process's own stdout and stderr are restored.
#[derive(Debug)]
pub struct JobRequest {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env_props: BTreeMap<String, String>,
    redirect: Option<StdioRedirect>,
}

impl JobRequest {
    /// Read a complete request from `client`.
    pub fn receive(client: &UnixStream) -> Result<Self> {
        let fds = recv_exact_fds(client, CLIENT_STREAM_COUNT).map_err(|e| {
            match e.kind() {
                io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                    RunnerError::Protocol(e.to_string())
                }
                _ => RunnerError::Io(e),
            }
        })?;
        let [stdin, stdout, stderr]: [OwnedFd; CLIENT_STREAM_COUNT] = fds
            .try_into()
            .map_err(|_| RunnerError::Protocol("Wrong number of client streams".into()))?;

        let mut reader = LineReader::new(client);
        let argv: Vec<String> = reader.read_message("argv")?;
        let cwd: String = reader.read_message("cwd")?;
        let env_props: BTreeMap<String, String> = reader.read_message("job properties")?;

        Ok(Self {
            stdin: File::from(stdin),
            stdout: File::from(stdout),
            stderr: File::from(stderr),
            argv,
            cwd: PathBuf::from(cwd),
            env_props,
            redirect: None,
        })
    }

    /// Send this process's stdout and stderr to the client's stderr until the request is dropped.
    pub fn redirect_logs(&mut self) -> Result<()> {
        if self.redirect.is_none() {
            self.redirect = Some(StdioRedirect::to(&self.stderr)?);
        }
        Ok(())
    }

    /// The arguments after the program name.
    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or(&[])
    }
}

/// Saved copies of fds 1 and 2, restored on drop.
#[derive(Debug)]
pub struct StdioRedirect {
    saved_stdout: OwnedFd,
    saved_stderr: OwnedFd,
}

impl StdioRedirect {
    /// Point fds 1 and 2 at `target`.
    pub fn to<F: AsFd>(target: F) -> Result<Self> {
        flush_std_streams();
        let saved_stdout = io::stdout().as_fd().try_clone_to_owned()?;
        let saved_stderr = io::stderr().as_fd().try_clone_to_owned()?;
        dup2_stdout(target.as_fd())?;
        dup2_stderr(target.as_fd())?;
        Ok(Self {
            saved_stdout,
            saved_stderr,
        })
    }
}

impl Drop for StdioRedirect {
    fn drop(&mut self) {
        flush_std_streams();
        let _ = dup2_stdout(&self.saved_stdout);
        let _ = dup2_stderr(&self.saved_stderr);
    }
}

fn flush_std_streams() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{LineWriter, send_fds};
    use std::io::{Read, Seek};
    use std::os::unix::io::{AsRawFd, RawFd};

    fn send_request(client: &UnixStream, files: &[File], argv: &[&str], cwd: &str) {
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
        send_fds(client, &raw).unwrap();
        let mut writer = LineWriter::new(client);
        writer.write_message(argv).unwrap();
        writer.write_message(cwd).unwrap();
        writer
            .write_message(&BTreeMap::from([("ROTATION", "90")]))
            .unwrap();
    }

    #[test]
    fn test_receive_request() {
        let (client, server) = UnixStream::pair().unwrap();
        let files: Vec<File> = (0..3).map(|_| tempfile::tempfile().unwrap()).collect();
        send_request(&client, &files, &["comprunner run", "input.txt", "-p"], "/work");

        let mut request = JobRequest::receive(&server).unwrap();
        assert_eq!(request.args(), ["input.txt", "-p"]);
        assert_eq!(request.cwd, PathBuf::from("/work"));
        assert_eq!(request.env_props["ROTATION"], "90");

        request.stdout.write_all(b"result").unwrap();
        drop(request);

        let mut out = &files[1];
        out.rewind().unwrap();
        let mut contents = String::new();
        out.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "result");
    }

    #[test]
    fn test_too_few_descriptors() {
        let (client, server) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fds(&client, &[file.as_raw_fd()]).unwrap();

        let err = JobRequest::receive(&server).unwrap_err();
        assert!(matches!(err, RunnerError::Protocol(_)));
    }

    #[test]
    fn test_truncated_payload() {
        let (client, server) = UnixStream::pair().unwrap();
        let files: Vec<File> = (0..3).map(|_| tempfile::tempfile().unwrap()).collect();
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();
        send_fds(&client, &raw).unwrap();
        LineWriter::new(&client)
            .write_message(&["comprunner run"])
            .unwrap();
        drop(client);

        let err = JobRequest::receive(&server).unwrap_err();
        assert!(err.to_string().contains("before cwd was received"));
    }

    #[test]
    fn test_client_gone() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(client);
        assert!(matches!(
            JobRequest::receive(&server),
            Err(RunnerError::Protocol(_))
        ));
    }
}
