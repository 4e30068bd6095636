//! Path utilities for jobs submitted from another working directory.
//!
//! Workers run with the dispatcher's working directory, not the client's, so
//! every relative path on a job command line is resolved against the cwd the
//! client sent along with the request.

use std::path::{Path, PathBuf};

/// Path argument meaning "the client's standard stream".
pub const STDIO_PATH: &str = "-";

/// Resolves a path the job will read from.
///
/// The client-relative path wins when it exists, or when the path as given
/// does not exist either (so error messages name the path the user meant).
/// Absolute paths are returned unchanged.
///
/// # Examples
///
/// ```
/// use std::path::{Path, PathBuf};
/// use comprunner::paths::resolve_input;
///
/// let resolved = resolve_input("/etc/hostname", Path::new("/home/user"));
/// assert_eq!(resolved, PathBuf::from("/etc/hostname"));
///
/// let resolved = resolve_input("no-such-file.jpg", Path::new("/home/user"));
/// assert_eq!(resolved, PathBuf::from("/home/user/no-such-file.jpg"));
/// ```
pub fn resolve_input<P: AsRef<Path>>(path: P, client_cwd: &Path) -> PathBuf {
    let path = path.as_ref();
    if path == Path::new(STDIO_PATH) {
        return path.to_path_buf();
    }
    let client_path = client_cwd.join(path);
    if client_path.exists() || !path.exists() {
        client_path
    } else {
        path.to_path_buf()
    }
}

/// Resolves a path the job will write to.
///
/// Same rule as [`resolve_input`], applied to the parent directory since the
/// file itself usually does not exist yet.
pub fn resolve_output<P: AsRef<Path>>(path: P, client_cwd: &Path) -> PathBuf {
    let path = path.as_ref();
    if path == Path::new(STDIO_PATH) {
        return path.to_path_buf();
    }
    let client_path = client_cwd.join(path);
    let client_dir_exists = client_path.parent().is_some_and(Path::is_dir);
    let provided_dir_exists = match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new(".").is_dir(),
        Some(parent) => parent.is_dir(),
        None => false,
    };
    if client_dir_exists || !provided_dir_exists {
        client_path
    } else {
        path.to_path_buf()
    }
}

/// Default log file name for a detached dispatcher with the given pid.
pub fn server_log_file_name(pid: u32) -> PathBuf {
    PathBuf::from(format!("component-server-{}.log", pid))
}

/// Path through which a process can reopen one of its own descriptors.
pub fn proc_fd_path(pid: u32, fd: i32) -> PathBuf {
    PathBuf::from(format!("/proc/{}/fd/{}", pid, fd))
}
