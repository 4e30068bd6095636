//! Buffered newline-delimited JSON over pipes and sockets.
//!
//! Both the client payload and the subprocess component protocol are framed as
//! one JSON document per line.

use crate::error::{Result, RunnerError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<std::process::ChildStdin> for PipeFd {
    fn from(stdin: std::process::ChildStdin) -> Self {
        Self::new(OwnedFd::from(stdin))
    }
}

impl From<std::process::ChildStdout> for PipeFd {
    fn from(stdout: std::process::ChildStdout) -> Self {
        Self::new(OwnedFd::from(stdout))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

/// Buffered line reader for IPC.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> LineReader<R> {
    /// Create a new line reader over any byte source.
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read a line, returning a reference to the internal buffer.
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        match self.reader.read_line(&mut self.line_buffer) {
            Ok(0) => Ok(None),
            Ok(_) => {
                if self.line_buffer.ends_with('\n') {
                    self.line_buffer.pop();
                }
                if self.line_buffer.ends_with('\r') {
                    self.line_buffer.pop();
                }
                Ok(Some(&self.line_buffer))
            }
            Err(e) => Err(e),
        }
    }

    /// Read one line and decode it as JSON.
    ///
    /// `what` names the expected message in the error reported for EOF or
    /// malformed input.
    pub fn read_message<T: DeserializeOwned>(&mut self, what: &str) -> Result<T> {
        match self.read_line()? {
            Some(line) => serde_json::from_str(line)
                .map_err(|e| RunnerError::Protocol(format!("Malformed {}: {}", what, e))),
            None => Err(RunnerError::Protocol(format!(
                "Connection closed before {} was received",
                what
            ))),
        }
    }

    /// Whether a complete or partial line is already buffered.
    ///
    /// Callers that poll the underlying descriptor must check this first,
    /// since buffered data will never make the descriptor readable again.
    pub fn has_buffered_data(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Borrow the underlying reader.
    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }
}

/// Buffered line writer for IPC.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    /// Create a new line writer over any byte sink.
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    /// Encode `message` as a single JSON line and flush.
    pub fn write_message<T: Serialize + ?Sized>(&mut self, message: &T) -> Result<()> {
        let line = serde_json::to_string(message)?;
        self.write_line(&line)?;
        Ok(())
    }

    /// Write raw bytes and flush.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }
}
