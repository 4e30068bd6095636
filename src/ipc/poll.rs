//! Waiting for readability on a set of descriptors.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::os::unix::io::BorrowedFd;
use std::time::{Duration, Instant};

/// Wait until at least one of `fds` is readable (or hung up), or `timeout` passes.
///
/// `None` waits forever. Returns the indices of the ready descriptors, which is
/// empty only on timeout. Interrupted polls are resumed with the remaining time.
pub fn poll_readable(fds: &[BorrowedFd<'_>], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut poll_fds: Vec<PollFd<'_>> = fds
            .iter()
            .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
            .collect();

        let wait = match deadline {
            None => PollTimeout::NONE,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Long timeouts are waited out in u16-millisecond slices.
                PollTimeout::from(remaining.as_millis().min(u128::from(u16::MAX)) as u16)
            }
        };

        match poll(&mut poll_fds, wait) {
            Ok(0) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Ok(Vec::new());
                }
            }
            Ok(_) => {
                let ready = poll_fds
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.revents().is_some_and(|r| !r.is_empty()))
                    .map(|(i, _)| i)
                    .collect();
                return Ok(ready);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
