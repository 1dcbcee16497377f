// src/engine/job.rs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, JobId};

/// The units of work that advance an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Preparation,
    Submission,
    StatusPoll,
    Completion,
    Cancellation,
    Cleanup,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Preparation,
        JobKind::Submission,
        JobKind::StatusPoll,
        JobKind::Completion,
        JobKind::Cancellation,
        JobKind::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Preparation => "preparation",
            JobKind::Submission => "submission",
            JobKind::StatusPoll => "status_poll",
            JobKind::Completion => "completion",
            JobKind::Cancellation => "cancellation",
            JobKind::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown job kind '{s}' (expected one of: {})",
                    JobKind::ALL.map(|k| k.as_str()).join(", ")
                )
            })
    }
}

/// One scheduled unit of work. Jobs are plain data so the queue can persist
/// them; retries reuse the same `id` with a higher `attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub execution_id: ExecutionId,
    pub kind: JobKind,
    /// 1-based.
    pub attempt: u32,
    pub run_at: DateTime<Utc>,
}

/// A follow-up job requested by a step that just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextJob {
    pub kind: JobKind,
    pub delay: Duration,
}

impl NextJob {
    pub fn now(kind: JobKind) -> Self {
        Self {
            kind,
            delay: Duration::ZERO,
        }
    }

    pub fn after(kind: JobKind, delay: Duration) -> Self {
        Self { kind, delay }
    }
}
