//! comprunner - keeps analytic components warm across command-line jobs.
//!
//! `comprunner run <media>` connects to a local dispatcher over an abstract
//! Unix socket, starting one if needed. The dispatcher hands the connection
//! to an idle worker process that already has the component loaded, and the
//! worker writes the job's JSON output straight to the client's stdout.

pub mod cli;
pub mod client;
pub mod component;
pub mod config;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod paths;
pub mod process;
pub mod protocol;
pub mod server;
pub mod worker;
