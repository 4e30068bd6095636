//! Line protocol between a worker and a subprocess plugin.
//!
//! Messages are JSON-serialized and newline-delimited. The plugin announces
//! itself with `ready`, then answers every `job` with zero or more `track`
//! lines followed by `done` or `error`.

use super::{Job, MediaKind, Track};
use serde::{Deserialize, Serialize};

/// Request from worker to plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PluginRequest {
    /// Run one job.
    #[serde(rename = "job")]
    Job {
        #[serde(flatten)]
        job: Job,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from plugin to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PluginResponse {
    /// Plugin initialized.
    #[serde(rename = "ready")]
    Ready {
        /// Media kinds the plugin accepts
        #[serde(default)]
        media_types: Vec<MediaKind>,
    },

    /// One result of the current job.
    #[serde(rename = "track")]
    Track { track: Track },

    /// The current job finished successfully.
    #[serde(rename = "done")]
    Done,

    /// The current job failed.
    #[serde(rename = "error")]
    Error {
        /// Error message
        message: String,
    },
}

impl PluginRequest {
    pub fn job(job: Job) -> Self {
        Self::Job { job }
    }
}

impl PluginResponse {
    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_job_request_is_flat() {
        let job = Job {
            name: "a.png".into(),
            media_path: "/tmp/a.png".into(),
            media_kind: MediaKind::Image,
            begin: 0,
            end: -1,
            job_properties: BTreeMap::from([("K".to_string(), "V".to_string())]),
            media_metadata: BTreeMap::new(),
        };
        let value = serde_json::to_value(PluginRequest::job(job)).unwrap();
        assert_eq!(value["type"], "job");
        assert_eq!(value["mediaPath"], "/tmp/a.png");
        assert_eq!(value["mediaKind"], "IMAGE");
        assert_eq!(value["jobProperties"]["K"], "V");
    }

    #[test]
    fn test_exit_request() {
        let line = serde_json::to_string(&PluginRequest::Exit).unwrap();
        assert_eq!(line, r#"{"type":"exit"}"#);
    }

    #[test]
    fn test_parse_responses() {
        let ready: PluginResponse =
            serde_json::from_str(r#"{"type":"ready","media_types":["IMAGE","VIDEO"]}"#).unwrap();
        match ready {
            PluginResponse::Ready { media_types } => {
                assert_eq!(media_types, vec![MediaKind::Image, MediaKind::Video])
            }
            other => panic!("Expected Ready, got {:?}", other),
        }

        let track: PluginResponse = serde_json::from_str(
            r#"{"type":"track","track":{"confidence":0.9,"properties":{"CLASS":"cat"}}}"#,
        )
        .unwrap();
        match track {
            PluginResponse::Track { track } => {
                assert_eq!(track.confidence, 0.9);
                assert_eq!(track.properties["CLASS"], "cat");
            }
            other => panic!("Expected Track, got {:?}", other),
        }

        assert!(matches!(
            serde_json::from_str::<PluginResponse>(r#"{"type":"done"}"#).unwrap(),
            PluginResponse::Done
        ));
    }

    #[test]
    fn test_error_response_roundtrip() {
        let line = serde_json::to_string(&PluginResponse::error("bad media")).unwrap();
        match serde_json::from_str::<PluginResponse>(&line).unwrap() {
            PluginResponse::Error { message } => assert_eq!(message, "bad media"),
            other => panic!("Expected Error, got {:?}", other),
        }
    }
}
