//! File descriptor passing over Unix-domain sockets (`SCM_RIGHTS`).
//!
//! A message always carries one byte of regular data ([`FD_MESSAGE_BYTE`])
//! because ancillary data cannot travel alone. Receivers read and ignore it.
//!
//! Received descriptors are wrapped in [`OwnedFd`] before anything else can
//! fail, so every early-return path closes them.

use crate::protocol::FD_MESSAGE_BYTE;
use nix::errno::Errno;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Room for more descriptors than any message in the protocol carries, so a
/// misbehaving peer cannot make us truncate (and leak) its extras.
const MAX_RECEIVED_FDS: usize = 8;

/// Send `fds` to the peer of `sock`.
///
/// Broken connections surface as [`io::ErrorKind::BrokenPipe`] or
/// [`io::ErrorKind::ConnectionReset`]; `MSG_NOSIGNAL` keeps them from raising
/// `SIGPIPE`.
pub fn send_fds(sock: &UnixStream, fds: &[RawFd]) -> io::Result<()> {
    let payload = [FD_MESSAGE_BYTE];
    let iov = [IoSlice::new(&payload)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    loop {
        match sendmsg::<UnixAddr>(
            sock.as_raw_fd(),
            &iov,
            &cmsgs,
            MsgFlags::MSG_NOSIGNAL,
            None,
        ) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Receive one descriptor-passing message from `sock`.
///
/// Returns `Ok(None)` when the peer closed the connection without sending
/// anything. A message that carries no descriptors yields an empty vector.
pub fn recv_fds(sock: &UnixStream) -> io::Result<Option<Vec<OwnedFd>>> {
    let mut payload = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_RECEIVED_FDS]);

    let (bytes, fds) = loop {
        let mut iov = [IoSliceMut::new(&mut payload)];
        match recvmsg::<UnixAddr>(
            sock.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut fds = Vec::new();
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                        // Safety: SCM_RIGHTS installs fresh descriptors in this
                        // process; nothing else owns them yet.
                        fds.extend(
                            raw_fds
                                .into_iter()
                                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
                        );
                    }
                }
                break (msg.bytes, fds);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    };

    if bytes == 0 && fds.is_empty() {
        return Ok(None);
    }
    Ok(Some(fds))
}

/// Receive exactly `expected` descriptors.
///
/// Any other count is an [`io::ErrorKind::InvalidData`] error; whatever was
/// received is closed before returning.
pub fn recv_exact_fds(sock: &UnixStream, expected: usize) -> io::Result<Vec<OwnedFd>> {
    match recv_fds(sock)? {
        Some(fds) if fds.len() == expected => Ok(fds),
        Some(fds) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "expected {} file descriptors but received {}",
                expected,
                fds.len()
            ),
        )),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before file descriptors were received",
        )),
    }
}

/// Whether `err` means the peer end of the socket is gone.
pub fn is_broken_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, Write};

    #[test]
    fn test_pass_single_socket() {
        let (control_parent, control_child) = UnixStream::pair().unwrap();
        let (mut client_end, server_end) = UnixStream::pair().unwrap();

        send_fds(&control_parent, &[server_end.as_raw_fd()]).unwrap();
        drop(server_end); // The receiver holds its own copy now.

        let mut fds = recv_exact_fds(&control_child, 1).unwrap();
        let mut received = UnixStream::from(fds.remove(0));
        received.write_all(b"ping").unwrap();

        let mut buf = [0u8; 4];
        client_end.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_pass_three_files() {
        let (left, right) = UnixStream::pair().unwrap();
        let files: Vec<File> = (0..3).map(|_| tempfile::tempfile().unwrap()).collect();
        let raw: Vec<RawFd> = files.iter().map(|f| f.as_raw_fd()).collect();

        send_fds(&left, &raw).unwrap();
        let fds = recv_exact_fds(&right, 3).unwrap();
        assert_eq!(fds.len(), 3);

        // Descriptors share the open file description with the originals.
        let mut received = File::from(fds.into_iter().nth(1).unwrap());
        received.write_all(b"shared").unwrap();
        let mut original = &files[1];
        original.rewind().unwrap();
        let mut contents = String::new();
        original.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared");
    }

    #[test]
    fn test_wrong_descriptor_count() {
        let (left, right) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        send_fds(&left, &[file.as_raw_fd()]).unwrap();

        let err = recv_exact_fds(&right, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("received 1"));
    }

    #[test]
    fn test_eof_returns_none() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(left);
        assert!(recv_fds(&right).unwrap().is_none());

        let err = recv_exact_fds(&right, 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_send_to_closed_peer_is_broken() {
        let (left, right) = UnixStream::pair().unwrap();
        drop(right);
        let file = tempfile::tempfile().unwrap();
        let err = send_fds(&left, &[file.as_raw_fd()]).unwrap_err();
        assert!(is_broken_connection(&err), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_plain_byte_has_no_descriptors() {
        let (mut left, right) = UnixStream::pair().unwrap();
        left.write_all(&[0]).unwrap();
        let fds = recv_fds(&right).unwrap().unwrap();
        assert!(fds.is_empty());
    }
}
