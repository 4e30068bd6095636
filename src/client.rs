//! The client side of `comprunner run`.
//!
//! The client does no work itself. It connects to the dispatcher (starting a
//! detached one if none is listening), hands over its own stdin, stdout and
//! stderr together with its command line, working directory and `MPF_PROP_*`
//! environment, and then waits for the single status byte, which becomes its
//! exit code.

use crate::error::{Result, RunnerError};
use crate::ipc::{LineReader, LineWriter, PipeFd, is_broken_connection, send_fds, transport};
use crate::protocol::{CLIENT_STREAM_COUNT, ServerStartup, job_props_from_env};
use crate::worker::job::PROGRAM_NAME;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// Run a job through the dispatcher on `socket_name` and return its status byte.
pub fn run_job(socket_name: &str, args: &[String]) -> Result<u8> {
    let conn = connect_or_start(socket_name)?;
    let argv: Vec<String> = std::iter::once(PROGRAM_NAME.to_string())
        .chain(args.iter().cloned())
        .collect();
    let cwd = std::env::current_dir()?;
    let props: BTreeMap<String, String> = job_props_from_env(std::env::vars()).collect();
    let stdio = [
        io::stdin().as_raw_fd(),
        io::stdout().as_raw_fd(),
        io::stderr().as_raw_fd(),
    ];
    submit_job(&conn, stdio, &argv, &cwd, &props)
}

/// Connect to the dispatcher, starting one if nobody is listening.
pub fn connect_or_start(socket_name: &str) -> Result<UnixStream> {
    match transport::connect(socket_name) {
        Ok(conn) => Ok(conn),
        Err(e) if transport::is_server_absent(&e) => {
            eprintln!("No existing server. Starting new one...");
            start_server(socket_name)?;
            Ok(transport::connect(socket_name)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Start a detached dispatcher and wait until it is listening.
fn start_server(socket_name: &str) -> Result<()> {
    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg("--socket")
        .arg(socket_name)
        .arg("serve")
        .arg("--detach")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        // Keep terminal signals aimed at this client away from the dispatcher.
        .process_group(0)
        .spawn()
        .map_err(|e| RunnerError::Worker(format!("Failed to start server: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RunnerError::Worker("Server stdout was not captured".into()))?;
    let mut reader = LineReader::new(PipeFd::from(stdout));
    let line = reader
        .read_line()?
        .map(str::to_string)
        .ok_or_else(|| RunnerError::Worker("Server exited before it was ready".into()))?;

    match ServerStartup::from_line(&line)? {
        ServerStartup::Ready { pid } => eprintln!("Server started with pid {}", pid),
        ServerStartup::AddressInUse => {
            eprintln!("Another server was started at the same time. Using existing server.");
        }
        ServerStartup::Error { message } => {
            return Err(RunnerError::Worker(format!(
                "Server failed to start: {}",
                message
            )));
        }
    }
    Ok(())
}

/// Send a job over an open connection and wait for its status byte.
///
/// `stdio` are the client's stdin, stdout and stderr, in that order.
pub fn submit_job(
    conn: &UnixStream,
    stdio: [RawFd; CLIENT_STREAM_COUNT],
    argv: &[String],
    cwd: &Path,
    props: &BTreeMap<String, String>,
) -> Result<u8> {
    send_fds(conn, &stdio).map_err(|e| server_gone(e.into()))?;
    let mut writer = LineWriter::new(conn);
    writer.write_message(argv).map_err(server_gone)?;
    writer
        .write_message(&cwd.to_string_lossy())
        .map_err(server_gone)?;
    writer.write_message(props).map_err(server_gone)?;
    debug!(argv = ?argv, "Job submitted");
    read_status(conn)
}

fn read_status(mut conn: &UnixStream) -> Result<u8> {
    let mut status = [0u8; 1];
    loop {
        match conn.read(&mut status) {
            Ok(0) => return Err(RunnerError::ServerDied),
            Ok(_) => return Ok(status[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_broken_connection(&e) => return Err(RunnerError::ServerDied),
            Err(e) => return Err(e.into()),
        }
    }
}

fn server_gone(err: RunnerError) -> RunnerError {
    match err {
        RunnerError::Io(e) if is_broken_connection(&e) => RunnerError::ServerDied,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::request::JobRequest;
    use std::io::Write;
    use std::thread;

    fn stdio_files() -> Vec<std::fs::File> {
        (0..CLIENT_STREAM_COUNT)
            .map(|_| tempfile::tempfile().unwrap())
            .collect()
    }

    #[test]
    fn test_submit_and_receive() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = thread::spawn(move || {
            let request = JobRequest::receive(&server).unwrap();
            let seen = (request.argv.clone(), request.cwd.clone(), request.env_props.clone());
            drop(request);
            (&server).write_all(&[2]).unwrap();
            seen
        });

        let files = stdio_files();
        let stdio = [files[0].as_raw_fd(), files[1].as_raw_fd(), files[2].as_raw_fd()];
        let argv = vec![PROGRAM_NAME.to_string(), "media.txt".to_string()];
        let props = BTreeMap::from([("ROTATION".to_string(), "90".to_string())]);
        let status = submit_job(&client, stdio, &argv, Path::new("/work"), &props).unwrap();
        assert_eq!(status, 2);

        let (seen_argv, seen_cwd, seen_props) = worker.join().unwrap();
        assert_eq!(seen_argv, argv);
        assert_eq!(seen_cwd, Path::new("/work"));
        assert_eq!(seen_props, props);
    }

    #[test]
    fn test_connection_closed_without_status() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = thread::spawn(move || {
            let request = JobRequest::receive(&server).unwrap();
            drop(request);
            drop(server);
        });

        let files = stdio_files();
        let stdio = [files[0].as_raw_fd(), files[1].as_raw_fd(), files[2].as_raw_fd()];
        let err = submit_job(
            &client,
            stdio,
            &[PROGRAM_NAME.to_string()],
            Path::new("/"),
            &BTreeMap::new(),
        )
        .unwrap_err();
        worker.join().unwrap();
        assert!(matches!(err, RunnerError::ServerDied));
    }

    #[test]
    fn test_server_gone_before_submit() {
        let (client, server) = UnixStream::pair().unwrap();
        drop(server);
        let files = stdio_files();
        let stdio = [files[0].as_raw_fd(), files[1].as_raw_fd(), files[2].as_raw_fd()];
        let err = submit_job(
            &client,
            stdio,
            &[PROGRAM_NAME.to_string()],
            Path::new("/"),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RunnerError::ServerDied));
    }
}
