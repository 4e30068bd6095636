//! Inter-process plumbing: the listening address, descriptor passing and line framing.

pub mod fdpass;
pub mod lines;
pub mod poll;
pub mod transport;

pub use fdpass::{is_broken_connection, recv_exact_fds, recv_fds, send_fds};
pub use lines::{LineReader, LineWriter, PipeFd};
pub use poll::poll_readable;
