//! Wire-level constants and messages shared by the client, dispatcher and workers.
//!
//! The job handoff itself is a sequence of socket operations (see
//! [`crate::worker::request`]); this module holds the pieces that more than one
//! side needs to agree on.

use serde::{Deserialize, Serialize};

/// Exit codes written as the final status byte on a client connection.
///
/// The byte is unsigned because process exit codes are.
pub mod exit_code {
    /// The job completed and all output was written.
    pub const SUCCESS: u8 = 0;
    /// The job failed.
    pub const FAILURE: u8 = 1;
    /// The job's command line could not be parsed.
    pub const USAGE: u8 = 2;
    /// The client disconnected before the job completed.
    pub const ABORTED: u8 = 3;
    /// The connection closed without a status byte (decided client-side).
    pub const SERVER_DIED: u8 = 6;
}

/// Byte a worker writes to its control channel after finishing a job.
pub const JOB_DONE: u8 = 0;

/// Payload byte accompanying every descriptor-passing message. Ignored by receivers.
pub const FD_MESSAGE_BYTE: u8 = 0;

/// Number of descriptors a client passes: stdin, stdout and stderr.
pub const CLIENT_STREAM_COUNT: usize = 3;

/// Environment variables with this prefix become job properties.
pub const JOB_PROP_ENV_PREFIX: &str = "MPF_PROP_";

/// Handshake line a detached dispatcher writes to the process that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerStartup {
    /// The dispatcher is bound and accepting connections.
    #[serde(rename = "ready")]
    Ready {
        /// Dispatcher process ID
        pid: u32,
    },

    /// Another dispatcher won the race to bind the address.
    #[serde(rename = "address_in_use")]
    AddressInUse,

    /// The dispatcher could not start.
    #[serde(rename = "error")]
    Error {
        /// Error message
        message: String,
    },
}

impl ServerStartup {
    /// Create a startup error message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Collect job properties from environment variables carrying [`JOB_PROP_ENV_PREFIX`].
///
/// The prefix is stripped; variables with nothing after the prefix are ignored.
pub fn job_props_from_env<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter().filter_map(|(key, value)| {
        key.strip_prefix(JOB_PROP_ENV_PREFIX)
            .filter(|name| !name.is_empty())
            .map(|name| (name.to_string(), value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_server_startup_ready() {
        let line = ServerStartup::Ready { pid: 1234 }.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("ready"));

        let parsed = ServerStartup::from_line(&line).unwrap();
        assert_eq!(parsed, ServerStartup::Ready { pid: 1234 });
    }

    #[test]
    fn test_server_startup_address_in_use() {
        let line = ServerStartup::AddressInUse.to_line().unwrap();
        assert_eq!(
            ServerStartup::from_line(&line).unwrap(),
            ServerStartup::AddressInUse
        );
    }

    #[test]
    fn test_server_startup_error() {
        let line = ServerStartup::error("permission denied").to_line().unwrap();
        match ServerStartup::from_line(&line).unwrap() {
            ServerStartup::Error { message } => assert_eq!(message, "permission denied"),
            other => panic!("Expected Error variant, got {:?}", other),
        }
    }

    #[test]
    fn test_job_props_from_env() {
        let vars = vec![
            ("MPF_PROP_ROTATION".to_string(), "90".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("MPF_PROP_".to_string(), "ignored".to_string()),
            ("MPF_PROP_CONFIDENCE".to_string(), "0.5".to_string()),
        ];
        let props: BTreeMap<_, _> = job_props_from_env(vars).collect();
        assert_eq!(props.len(), 2);
        assert_eq!(props["ROTATION"], "90");
        assert_eq!(props["CONFIDENCE"], "0.5");
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let codes = [
            exit_code::SUCCESS,
            exit_code::FAILURE,
            exit_code::USAGE,
            exit_code::ABORTED,
            exit_code::SERVER_DIED,
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
