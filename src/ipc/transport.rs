//! The dispatcher's listening address.
//!
//! The socket lives in Linux's abstract namespace: no filesystem entry exists,
//! so a crashed dispatcher can never leave behind a stale path that blocks the
//! next one from binding.

use crate::error::{Result, RunnerError};
use std::io;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};

/// Build the abstract address for `name`.
pub fn socket_addr(name: &str) -> io::Result<SocketAddr> {
    SocketAddr::from_abstract_name(name.as_bytes())
}

/// Bind a listener on the abstract address `name`.
///
/// A name already in use maps to [`RunnerError::AddressInUse`] so callers
/// racing to start a dispatcher can tell "someone else won" from real failures.
pub fn bind(name: &str) -> Result<UnixListener> {
    let addr = socket_addr(name)?;
    UnixListener::bind_addr(&addr).map_err(|e| match e.kind() {
        io::ErrorKind::AddrInUse => RunnerError::AddressInUse(name.to_string()),
        _ => RunnerError::Io(e),
    })
}

/// Connect to the dispatcher listening on `name`.
pub fn connect(name: &str) -> io::Result<UnixStream> {
    let addr = socket_addr(name)?;
    UnixStream::connect_addr(&addr)
}

/// Whether a connect error means no dispatcher is listening.
pub fn is_server_absent(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}
