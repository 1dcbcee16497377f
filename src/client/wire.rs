// src/client/wire.rs

//! Request/response bodies of the WES-style execution service, plus the
//! mapping from remote run states to what the status poller should do next.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-assigned run identifier.
pub type RunId = String;

/// Everything sent to `POST /runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub workflow_params: Value,
    pub workflow_type: String,
    pub workflow_type_version: String,
    pub workflow_url: String,
    #[serde(default)]
    pub workflow_engine: Option<String>,
    #[serde(default)]
    pub workflow_engine_version: Option<String>,
    #[serde(default)]
    pub workflow_engine_parameters: Value,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Body of `POST /runs` and `POST /runs/{id}/cancel` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdResponse {
    pub run_id: RunId,
}

/// Acknowledgement of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAck {
    pub run_id: RunId,
}

/// Subset of the WES `RunLog` we care about (`GET /runs/{id}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub outputs: Value,
}

/// Remote run state as reported by the execution service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Unknown,
    Queued,
    Initializing,
    Running,
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
    Canceling,
    Preempted,
    /// Anything the service sends that we do not know about.
    Unrecognized(String),
}

/// What a status poll means for the local execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Still going; poll again later.
    Pending,
    Succeeded,
    Failed,
}

impl RemoteStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => RemoteStatus::Unknown,
            "QUEUED" => RemoteStatus::Queued,
            "INITIALIZING" => RemoteStatus::Initializing,
            "RUNNING" => RemoteStatus::Running,
            "PAUSED" => RemoteStatus::Paused,
            "COMPLETE" => RemoteStatus::Complete,
            "EXECUTOR_ERROR" => RemoteStatus::ExecutorError,
            "SYSTEM_ERROR" => RemoteStatus::SystemError,
            "CANCELED" | "CANCELLED" => RemoteStatus::Canceled,
            "CANCELING" | "CANCELLING" => RemoteStatus::Canceling,
            "PREEMPTED" => RemoteStatus::Preempted,
            _ => RemoteStatus::Unrecognized(raw.to_string()),
        }
    }

    /// Unrecognized states keep the poller going rather than failing a run
    /// that may still be in progress.
    pub fn outcome(&self) -> PollOutcome {
        match self {
            RemoteStatus::Complete => PollOutcome::Succeeded,
            RemoteStatus::ExecutorError | RemoteStatus::SystemError | RemoteStatus::Canceled => {
                PollOutcome::Failed
            }
            RemoteStatus::Unknown
            | RemoteStatus::Queued
            | RemoteStatus::Initializing
            | RemoteStatus::Running
            | RemoteStatus::Paused
            | RemoteStatus::Canceling
            | RemoteStatus::Preempted
            | RemoteStatus::Unrecognized(_) => PollOutcome::Pending,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteStatus::Unknown => "UNKNOWN",
            RemoteStatus::Queued => "QUEUED",
            RemoteStatus::Initializing => "INITIALIZING",
            RemoteStatus::Running => "RUNNING",
            RemoteStatus::Paused => "PAUSED",
            RemoteStatus::Complete => "COMPLETE",
            RemoteStatus::ExecutorError => "EXECUTOR_ERROR",
            RemoteStatus::SystemError => "SYSTEM_ERROR",
            RemoteStatus::Canceled => "CANCELED",
            RemoteStatus::Canceling => "CANCELING",
            RemoteStatus::Preempted => "PREEMPTED",
            RemoteStatus::Unrecognized(raw) => raw.as_str(),
        };
        f.write_str(s)
    }
}

/// One output file produced by a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub url: String,
}

/// The outputs of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub artifacts: Vec<Artifact>,
}

impl ArtifactSet {
    pub fn new(artifacts: Vec<Artifact>) -> Self {
        Self { artifacts }
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Interpret the free-form `outputs` field of a run log.
    ///
    /// Two shapes are understood:
    /// - a list of objects with `file_name`/`file_url` (or `name`/`url`)
    /// - an object mapping names to either a URL string or an object with
    ///   `file_url`, `url` or `location`
    ///
    /// Entries without a usable URL are skipped.
    pub fn from_outputs(outputs: &Value) -> Self {
        let mut artifacts = Vec::new();

        match outputs {
            Value::Array(items) => {
                for item in items {
                    let name = first_str(item, &["file_name", "name"]);
                    let url = first_str(item, &["file_url", "url", "location"]);
                    if let (Some(name), Some(url)) = (name, url) {
                        artifacts.push(Artifact {
                            name: name.to_string(),
                            url: url.to_string(),
                        });
                    }
                }
            }
            Value::Object(map) => {
                for (name, entry) in map {
                    let url = match entry {
                        Value::String(s) => Some(s.as_str()),
                        other => first_str(other, &["file_url", "url", "location"]),
                    };
                    if let Some(url) = url {
                        artifacts.push(Artifact {
                            name: name.clone(),
                            url: url.to_string(),
                        });
                    }
                }
            }
            _ => {}
        }

        Self { artifacts }
    }
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| value.get(*k).and_then(Value::as_str))
}
